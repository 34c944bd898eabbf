//! Error types for the transaction engine.

use crate::types::Phase;
use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// The particular condition under which a transactional lock acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum CollisionStatus {
    /// Mutual attempt to acquire held locks, detected by the cross-lock validator.
    CrossLock,
    /// A bounded lock wait expired.
    Timeout,
}

impl fmt::Display for CollisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionStatus::CrossLock => write!(f, "cross-lock"),
            CollisionStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The current task collided with another and must be retried.
    ///
    /// This is the engine's internal retry signal. Task bodies propagate it
    /// with `?`; it never reaches the submitter unless the retry budget runs out.
    #[error("lock collision ({status}); task will be retried")]
    Collision {
        /// What kind of collision occurred.
        status: CollisionStatus,
    },

    /// The task was retried the maximum number of times and collided again.
    #[error("failed to acquire all necessary locks after {retries} retries (last collision: {status})")]
    ConcurrentAccess {
        /// Number of retries performed.
        retries: u32,
        /// The collision that ended the final attempt.
        status: CollisionStatus,
    },

    /// An operation was attempted in a phase that does not permit it.
    #[error("cannot {operation} in phase {phase}")]
    InvalidPhase {
        /// The attempted operation.
        operation: &'static str,
        /// The phase the session was in.
        phase: Phase,
    },

    /// The locking protocol was violated by a collaborator.
    #[error("lock protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// An actor was registered without an enclosing instantiation frame.
    #[error("no instantiation frame available for {role} registration")]
    NoInstantiationFrame {
        /// The requested synchronization role.
        role: &'static str,
    },

    /// A layout actor was registered with no layout root bound to its transaction.
    #[error("no layout root bound to transaction {transaction}")]
    MissingLayoutRoot {
        /// Name of the transaction type.
        transaction: &'static str,
    },

    /// The operation is not supported by the target.
    #[error("unsupported operation: {message}")]
    UnsupportedOperation {
        /// Description of the operation.
        message: String,
    },

    /// A new outer task was submitted on a thread already driving a session.
    #[error("thread already drives a session; submit nested work through the task context")]
    NestedSubmission,

    /// A task body failed on its own account.
    #[error("task failed: {message}")]
    Task {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates the internal retry signal.
    pub fn collision(status: CollisionStatus) -> Self {
        Self::Collision { status }
    }

    /// Creates an invalid phase error.
    pub fn invalid_phase(operation: &'static str, phase: Phase) -> Self {
        Self::InvalidPhase { operation, phase }
    }

    /// Creates a protocol violation error.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
        }
    }

    /// Creates a task failure.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
        }
    }

    /// Returns true if this error is the internal retry signal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Collision { .. })
    }

    /// Returns the collision status carried by a retry signal or exhausted-retry failure.
    #[must_use]
    pub fn collision_status(&self) -> Option<CollisionStatus> {
        match self {
            Self::Collision { status } | Self::ConcurrentAccess { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_collisions_are_retryable() {
        assert!(CoreError::collision(CollisionStatus::CrossLock).is_retryable());
        assert!(CoreError::collision(CollisionStatus::Timeout).is_retryable());
        assert!(!CoreError::protocol_violation("x").is_retryable());
        assert!(!CoreError::ConcurrentAccess {
            retries: 10,
            status: CollisionStatus::Timeout
        }
        .is_retryable());
        assert!(!CoreError::NestedSubmission.is_retryable());
    }

    #[test]
    fn exhausted_failure_reports_status() {
        let err = CoreError::ConcurrentAccess {
            retries: 3,
            status: CollisionStatus::CrossLock,
        };
        assert_eq!(err.collision_status(), Some(CollisionStatus::CrossLock));
        assert!(err.to_string().contains("after 3 retries"));
    }

    #[test]
    fn invalid_phase_message() {
        let err = CoreError::invalid_phase("execute a task", Phase::Commit);
        assert_eq!(err.to_string(), "cannot execute a task in phase COMMIT");
    }
}
