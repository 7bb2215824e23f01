//! Crate level errors.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! is [`Error`]. The variants fall into three groups:
//!
//! ## Partition level
//!
//! - [`Error::LeaseLost`]: another host owns the partition now. The worker for
//!   that partition stops; the processor keeps running.
//! - [`Error::TransientReadFailure`]: the feed could not be read after the
//!   store retry policy gave up. The worker restarts after a cooldown.
//! - [`Error::HandlerFailure`]: the user handler kept failing for the same
//!   batch. The worker stops without advancing the checkpoint.
//!
//! ## Processor level
//!
//! - [`Error::Startup`]: a store could not be reached while starting. Fatal to
//!   `start()`.
//! - [`Error::Config`]: invalid configuration.
//!
//! ## Store level
//!
//! - [`Error::VersionConflict`]: a conditional write lost a race.
//! - [`Error::Unavailable`], [`Error::ObjectStore`]: the store misbehaved.
//!   Retriable, see [`Error::is_retriable`].

use std::result;

use thiserror::Error as ThisError;

use crate::types::PartitionId;

pub type Result<T> = result::Result<T, Error>;

/// Error type returned by user handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Renewal or checkpoint found that another host owns the lease.
    #[error("Lease lost for partition {partition}")]
    LeaseLost { partition: PartitionId },

    /// The feed could not be read after bounded retries.
    #[error("Transient read failure on partition {partition}: {message}")]
    TransientReadFailure {
        partition: PartitionId,
        message: String,
    },

    /// The handler failed for the same batch until the retry policy gave up.
    #[error("Handler failed on partition {partition} after {attempts} attempts: {message}")]
    HandlerFailure {
        partition: PartitionId,
        attempts: u32,
        message: String,
    },

    /// A store could not be reached while starting the processor.
    #[error("Startup failed: {0}")]
    Startup(String),

    /// A conditional write found a different version than expected.
    #[error("Version conflict on {key}: expected version {expected}")]
    VersionConflict { key: String, expected: u64 },

    /// The store is temporarily unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A record, lease or container does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A document is missing its partition key or is otherwise malformed.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// A continuation token could not be parsed.
    #[error("Invalid continuation token: {0:?}")]
    InvalidToken(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from the object store backend.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl Error {
    /// Returns true if the operation may succeed when retried.
    ///
    /// Ownership and handler outcomes are never retriable at the store layer:
    /// they are decided by the lease manager and the dispatcher.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Unavailable(_) | Error::TransientReadFailure { .. } => true,
            Error::ObjectStore(e) => is_object_store_error_retryable(e),
            _ => false,
        }
    }

    /// Returns true if this error means the partition is owned elsewhere.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Error::LeaseLost { .. })
    }

    /// Returns true if a conditional write lost a race.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::VersionConflict { .. } => true,
            Error::ObjectStore(object_store::Error::AlreadyExists { .. })
            | Error::ObjectStore(object_store::Error::Precondition { .. }) => true,
            _ => false,
        }
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            Error::LeaseLost { .. } => "lease_lost",
            Error::TransientReadFailure { .. } => "transient_read",
            Error::HandlerFailure { .. } => "handler",
            Error::Startup(_) => "startup",
            Error::VersionConflict { .. } => "conflict",
            Error::Unavailable(_) => "unavailable",
            Error::NotFound(_) => "not_found",
            Error::InvalidDocument(_) => "invalid_document",
            Error::InvalidToken(_) => "invalid_token",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::ObjectStore(_) => "object_store",
        }
    }
}

fn is_object_store_error_retryable(e: &object_store::Error) -> bool {
    use object_store::Error as ObjErr;
    match e {
        ObjErr::NotFound { .. } => false,
        ObjErr::AlreadyExists { .. } => false,
        ObjErr::Precondition { .. } => false,
        ObjErr::NotModified { .. } => false,
        ObjErr::NotImplemented => false,
        ObjErr::InvalidPath { .. } => false,
        ObjErr::PermissionDenied { .. } => false,
        ObjErr::Unauthenticated { .. } => false,
        ObjErr::UnknownConfigurationKey { .. } => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_lost_display() {
        let err = Error::LeaseLost {
            partition: PartitionId::from("3"),
        };
        assert_eq!(err.to_string(), "Lease lost for partition 3");
        assert!(err.is_lease_lost());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_handler_failure_display() {
        let err = Error::HandlerFailure {
            partition: PartitionId::from("0"),
            attempts: 4,
            message: "boom".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("after 4 attempts"));
        assert!(display.contains("boom"));
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::Unavailable("down".to_string()).is_retriable());
        assert!(
            Error::TransientReadFailure {
                partition: PartitionId::from("1"),
                message: "timeout".to_string(),
            }
            .is_retriable()
        );
        assert!(!Error::Config("bad".to_string()).is_retriable());
        assert!(!Error::NotFound("x".to_string()).is_retriable());
        assert!(
            !Error::VersionConflict {
                key: "lease".to_string(),
                expected: 1
            }
            .is_retriable()
        );
    }

    #[test]
    fn test_object_store_classification() {
        let already_exists = Error::ObjectStore(object_store::Error::AlreadyExists {
            path: "leases/0/1.json".to_string(),
            source: "exists".into(),
        });
        assert!(already_exists.is_conflict());
        assert!(!already_exists.is_retriable());

        let generic = Error::ObjectStore(object_store::Error::Generic {
            store: "test",
            source: "connection reset".into(),
        });
        assert!(generic.is_retriable());
        assert!(!generic.is_conflict());
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(Error::Startup("unreachable".to_string()));
        assert!(err.to_string().contains("Startup failed"));
    }

    #[test]
    fn test_metric_labels() {
        assert_eq!(
            Error::Unavailable("x".to_string()).as_metric_label(),
            "unavailable"
        );
        assert_eq!(
            Error::LeaseLost {
                partition: PartitionId::from("0")
            }
            .as_metric_label(),
            "lease_lost"
        );
    }
}
