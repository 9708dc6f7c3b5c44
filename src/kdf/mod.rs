//! Cryptographic collaborators of the session
//!
//! The coordinator only needs two pure functions: a sequential stretch that
//! runs on the coordinator thread, and a memory-hard block mix that runs
//! inside execution units. Both sit behind traits so the orchestration can
//! be exercised with other primitives.

pub mod mix;
pub mod stretch;

pub use mix::{BlockMixer, MixError, ScryptMixer};
pub use stretch::{Pbkdf2Sha256, Stretch};
