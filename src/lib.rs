//! # parascrypt - scrypt with a parallel mixing pool
//!
//! Computes scrypt-family keys by running the sequential stretch phase on a
//! coordinator and spreading the `P` independent block mixes over a bounded,
//! reusable pool of execution units.
//!
//! ## Features
//!
//! - **Session Lifecycle**: configure once, derive many times, release or shut down
//! - **Shared Arena**: one 64 KiB-aligned buffer that only grows
//! - **Pluggable Units**: threads by default, anything implementing [`parallel::ExecutionUnit`]
//! - **Deterministic Output**: completion order never changes the key
//!
//! ## Quick Start
//!
//! ```no_run
//! use parascrypt::Session;
//!
//! let session = Session::with_defaults()?;
//! session.configure(16384, 8, 1, None).wait()?;
//! let key = session.derive(b"pwd", b"NaCl", Some(64)).wait()?;
//! assert_eq!(key.len(), 64);
//! session.shutdown()?;
//! # Ok::<(), parascrypt::SessionError>(())
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod kdf;
pub mod logging;
pub mod parallel;
pub mod protocol;
pub mod session;

pub use config::SessionLimits;
pub use error::SessionError;
pub use session::{Pending, Session, SessionBuilder, SessionConfig, SessionState, SessionStats};

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
