//! Error types for slicegraph-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Adapter I/O failure (database, network, lock poisoning)
    Storage,
    /// Serialization/deserialization errors
    Serialization,
    /// Record not found
    NotFound,
    /// Idempotent write saw a different content hash for an existing key
    Conflict,
    /// Invalid arguments handed to an adapter
    Validation,
    /// Configuration errors
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Storage => "storage",
            ErrorKind::Serialization => "serialization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
    /// Natural key of the offending record, when one is known
    pub key: Option<String>,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            key: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    // Convenience constructors
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(what: &str, key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(ErrorKind::NotFound, format!("{} not found: {}", what, key)).with_key(key)
    }

    /// Hash mismatch on an idempotent put.
    pub fn conflict(
        key: impl Into<String>,
        existing_hash: &str,
        incoming_hash: &str,
    ) -> Self {
        let key = key.into();
        Self::new(
            ErrorKind::Conflict,
            format!(
                "Content hash mismatch for {}: existing={} incoming={}",
                key, existing_hash, incoming_hash
            ),
        )
        .with_key(key)
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    // ═══════════════════════════════════════════════════════════════════════
    // Error Construction Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("raw record", "PRODUCT#t1#p1@v3");
        let msg = format!("{}", err);
        assert!(msg.contains("not_found"));
        assert!(msg.contains("PRODUCT#t1#p1@v3"));
        assert_eq!(err.key.as_deref(), Some("PRODUCT#t1#p1@v3"));
    }

    #[test]
    fn test_storage_error() {
        let err = StorageError::storage("Connection failed");
        assert_eq!(err.kind, ErrorKind::Storage);
        assert_eq!(err.message, "Connection failed");
        assert!(err.source.is_none());
        assert_eq!(format!("{}", err), "[storage] Connection failed");
    }

    #[test]
    fn test_conflict_carries_key_and_hashes() {
        let err = StorageError::conflict("t1/PRODUCT#t1#p1/v1/CORE", "aaa", "bbb");
        assert!(err.is_conflict());
        assert_eq!(err.key.as_deref(), Some("t1/PRODUCT#t1#p1/v1/CORE"));

        let msg = format!("{}", err);
        assert!(msg.starts_with("[conflict]"));
        assert!(msg.contains("existing=aaa"));
        assert!(msg.contains("incoming=bbb"));
    }

    #[test]
    fn test_with_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StorageError::storage("DB file missing").with_source(io_err);

        assert_eq!(err.kind, ErrorKind::Storage);
        let source = err.source().unwrap();
        assert!(source.to_string().contains("file not found"));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ErrorKind Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::Storage.as_str(), "storage");
        assert_eq!(ErrorKind::Serialization.as_str(), "serialization");
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found");
        assert_eq!(ErrorKind::Conflict.as_str(), "conflict");
        assert_eq!(ErrorKind::Validation.as_str(), "validation");
        assert_eq!(ErrorKind::Config.as_str(), "config");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversion Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json")
            .err()
            .unwrap();
        let err: StorageError = json_err.into();

        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("JSON error"));
        assert!(err.source.is_some());
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> Result<()> {
            Err(StorageError::not_found("slice", "k"))
        }

        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }

        let err = outer().unwrap_err();
        assert!(err.is_not_found());
    }
}
