//! Error types for Tabula.

use thiserror::Error;

/// Result type alias using TabulaError.
pub type Result<T> = std::result::Result<T, TabulaError>;

/// Errors that can occur in Tabula index operations.
#[derive(Debug, Error)]
pub enum TabulaError {
    // Storage errors
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("no storage space: {requested} pages requested, limit is {limit}")]
    NoStorageSpace { requested: u64, limit: u64 },

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u32, reason: String },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // Index errors
    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Index node full")]
    NodeFull,

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("Index build cancelled")]
    BuildCancelled,

    // Row iterator errors
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // Parameter errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TabulaError {
    /// Shorthand for an `InvalidParameter` error.
    pub fn invalid(name: impl Into<String>, value: impl ToString) -> Self {
        TabulaError::InvalidParameter {
            name: name.into(),
            value: value.to_string(),
        }
    }

    /// Returns true for errors raised by the storage layer rather than by the caller.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            TabulaError::StorageIo(_)
                | TabulaError::NoStorageSpace { .. }
                | TabulaError::PageNotFound { .. }
                | TabulaError::PageCorrupted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: TabulaError = io_err.into();
        assert!(matches!(err, TabulaError::StorageIo(_)));
        assert!(err.to_string().contains("storage I/O error"));
        assert!(err.is_storage());
    }

    #[test]
    fn test_no_storage_space_display() {
        let err = TabulaError::NoStorageSpace {
            requested: 130,
            limit: 128,
        };
        assert_eq!(
            err.to_string(),
            "no storage space: 130 pages requested, limit is 128"
        );
        assert!(err.is_storage());
    }

    #[test]
    fn test_page_errors_display() {
        let err = TabulaError::PageNotFound { page_id: 42 };
        assert_eq!(err.to_string(), "Page not found: 42");

        let err = TabulaError::PageCorrupted {
            page_id: 7,
            reason: "bad magic".to_string(),
        };
        assert_eq!(err.to_string(), "Page corrupted: 7, reason: bad magic");
    }

    #[test]
    fn test_index_errors_display() {
        assert_eq!(TabulaError::DuplicateKey.to_string(), "Duplicate key");
        assert_eq!(TabulaError::NodeFull.to_string(), "Index node full");
        assert_eq!(
            TabulaError::BuildCancelled.to_string(),
            "Index build cancelled"
        );
        assert_eq!(
            TabulaError::IndexCorrupted("separator out of order".to_string()).to_string(),
            "Index corrupted: separator out of order"
        );
        assert!(!TabulaError::DuplicateKey.is_storage());
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = TabulaError::invalid("key_len", 0);
        assert_eq!(err.to_string(), "Invalid parameter: key_len = 0");
    }

    #[test]
    fn test_row_errors_display() {
        let err = TabulaError::ColumnNotFound("amount".to_string());
        assert_eq!(err.to_string(), "Column not found: amount");

        let err = TabulaError::TypeMismatch {
            expected: "Integer".to_string(),
            actual: "String".to_string(),
        };
        assert_eq!(err.to_string(), "Type mismatch: expected Integer, got String");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(TabulaError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TabulaError>();
    }
}
