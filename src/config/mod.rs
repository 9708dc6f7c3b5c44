//! Configuration management for parascrypt
//!
//! Session limits are layered the same way everywhere: embedded defaults,
//! then an optional TOML file, then `PARASCRYPT_*` environment variables.
//! Cost parameters (`N`, `r`, `P`) are not configuration; they are passed
//! to [`crate::Session::configure`] directly.

pub mod core;

pub use core::SessionLimits;
