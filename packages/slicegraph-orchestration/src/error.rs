use crate::fanout::FanoutJob;
use slicegraph_storage::{ErrorKind, StorageError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Idempotency hash mismatch: non-deterministic rule or corrupted data
    #[error("Invariant violation at {key}: {detail}")]
    InvariantViolation { key: String, detail: String },

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Missing slices for {entity_key}: {}", missing.join(", "))]
    MissingSlices {
        entity_key: String,
        missing: Vec<String>,
    },

    #[error("Unmapped change path: {path}")]
    UnmappedChangePath { path: String },

    #[error("Invalid deploy transition: {state} + {event}")]
    InvalidTransition { state: String, event: String },

    /// Raised by the ERROR breaker; `job` is the rejected job, marked failed
    #[error("Fanout limit exceeded: {candidates} candidates > max_fanout {max_fanout}")]
    FanoutLimitExceeded {
        candidates: usize,
        max_fanout: usize,
        job: Box<FanoutJob>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn contract<E: std::fmt::Display>(e: E) -> Self {
        Self::Contract(e.to_string())
    }

    /// Retry classification used when logging at the outbox boundary
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Storage(_) | OrchestratorError::Timeout(_) => {
                ErrorCategory::Transient
            }
            OrchestratorError::InvariantViolation { .. } => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        match err.kind {
            ErrorKind::Conflict => OrchestratorError::InvariantViolation {
                key: err.key.clone().unwrap_or_default(),
                detail: err.message,
            },
            ErrorKind::NotFound => OrchestratorError::NotFound(err.message),
            ErrorKind::Validation => OrchestratorError::Validation(err.message),
            _ => OrchestratorError::Storage(err),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::serialization(err)
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - a later poll may succeed (e.g., timeout, storage)
    Transient,
    /// Permanent error - retrying the same input fails again (e.g., invalid input)
    Permanent,
    /// Infrastructure error - alert ops (e.g., hash conflict, corruption)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_invariant_violation_with_key() {
        let err: OrchestratorError =
            StorageError::conflict("t1/PRODUCT#t1#p1/v1/CORE", "aaa", "bbb").into();
        match &err {
            OrchestratorError::InvariantViolation { key, .. } => {
                assert_eq!(key, "t1/PRODUCT#t1#p1/v1/CORE");
            }
            other => panic!("Expected InvariantViolation, got {:?}", other),
        }
        assert!(err.to_string().contains("t1/PRODUCT#t1#p1/v1/CORE"));
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
    }

    #[test]
    fn test_not_found_mapping() {
        let err: OrchestratorError = StorageError::not_found("raw record", "k").into();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_storage_is_transient() {
        let err: OrchestratorError = StorageError::storage("io").into();
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_missing_slices_lists_every_type() {
        let err = OrchestratorError::MissingSlices {
            entity_key: "PRODUCT#t1#p1".to_string(),
            missing: vec!["PRICE".to_string(), "STOCK".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("PRICE"));
        assert!(msg.contains("STOCK"));
    }

    #[test]
    fn test_unmapped_path_in_message() {
        let err = OrchestratorError::UnmappedChangePath {
            path: "attributes.color".to_string(),
        };
        assert!(err.to_string().contains("attributes.color"));
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
        assert_eq!(ErrorCategory::Permanent.to_string(), "permanent");
        assert_eq!(ErrorCategory::Infrastructure.to_string(), "infrastructure");
    }
}
