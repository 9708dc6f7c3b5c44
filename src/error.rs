//! Error taxonomy for session operations
//!
//! Input and lifecycle errors are raised before any message reaches an
//! execution unit. Allocation failures and protocol violations originate in
//! the units and are surfaced through the pending result of whatever
//! operation was in flight.

use thiserror::Error;

use crate::protocol::UnitId;
use crate::session::SessionState;

/// Reason reported to callers when a unit could not allocate its working memory.
pub const ALLOC_FAIL_REASON: &str = "memory alloc fail";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("password is {len} bytes, limit is {max}")]
    PasswordTooLong { len: usize, max: usize },

    #[error("salt is {len} bytes, limit is {max}")]
    SaltTooLong { len: usize, max: usize },

    #[error("output length {requested} is outside 1..={max}")]
    InvalidOutputLength { requested: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("{0}")]
    AllocationFailed(String),

    #[error("protocol violation from unit {unit}: {detail}")]
    ProtocolViolation { unit: UnitId, detail: String },

    #[error("failed to start execution unit: {0}")]
    Spawn(String),

    #[error("session has been shut down")]
    Terminated,
}

impl SessionError {
    /// Allocation failure carrying the fixed caller-facing reason.
    pub fn allocation() -> Self {
        SessionError::AllocationFailed(ALLOC_FAIL_REASON.to_string())
    }

    /// True for errors raised by argument checks rather than by the pool.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            SessionError::PasswordTooLong { .. }
                | SessionError::SaltTooLong { .. }
                | SessionError::InvalidOutputLength { .. }
                | SessionError::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_reason_is_fixed() {
        let err = SessionError::allocation();
        assert_eq!(err.to_string(), "memory alloc fail");
        assert!(!err.is_invalid_input());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = SessionError::InvalidState {
            operation: "derive",
            state: SessionState::Configuring,
        };
        assert_eq!(err.to_string(), "cannot derive while session is configuring");
    }

    #[test]
    fn test_input_errors_classified() {
        assert!(SessionError::SaltTooLong { len: 65, max: 64 }.is_invalid_input());
        let zero_len = SessionError::InvalidOutputLength {
            requested: 0,
            max: 64,
        };
        assert!(zero_len.is_invalid_input());
        assert!(!SessionError::Terminated.is_invalid_input());
    }
}
