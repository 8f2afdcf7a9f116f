use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Uniform result code reported by every operation.
///
/// `ShardMemError::code` maps each error onto one of these, so callers that
/// only care about the category can match on the code instead of the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Success,
    /// Bad or inconsistent arguments
    InvalidInput,
    /// Unknown, already-destroyed, or foreign handle
    InvalidHandle,
    /// Addressing mode unavailable on this memory type/platform
    NotSupported,
    /// Stubbed feature
    NotImplemented,
    /// Allocation failure
    ResourceExhausted,
    /// Rendezvous or collective wait expired
    Timeout,
    /// Internal invariant violated
    LogicError,
    /// File record count or size disagrees with the allocation
    SizeMismatch,
    /// A named file does not exist
    NotFound,
    /// File read/write failure
    IoError,
    /// Transport to the rank group was lost or corrupted
    CommunicationError,
}

/// Errors that can occur in shardmem operations.
#[derive(Error, Debug)]
pub enum ShardMemError {
    /// Bad or inconsistent arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Handle not known to this context (destroyed, stale, or foreign)
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Memory provider could not satisfy an allocation
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal invariant violated (e.g. live allocations on teardown)
    #[error("Logic error: {0}")]
    Logic(String),

    #[error("Size mismatch: {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    /// IO error occurred (file operations, sockets, shared memory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer socket closed, malformed frame, or group aborted by the root
    #[error("Communication error: {0}")]
    Communication(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShardMemError {
    /// Category of this error in the uniform taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            ShardMemError::InvalidInput(_)
            | ShardMemError::Serialization(_)
            | ShardMemError::Config(_) => ErrorCode::InvalidInput,
            ShardMemError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            ShardMemError::NotSupported(_) => ErrorCode::NotSupported,
            ShardMemError::NotImplemented(_) => ErrorCode::NotImplemented,
            ShardMemError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            ShardMemError::Timeout(_) => ErrorCode::Timeout,
            ShardMemError::Logic(_) => ErrorCode::LogicError,
            ShardMemError::SizeMismatch { .. } => ErrorCode::SizeMismatch,
            ShardMemError::NotFound(_) => ErrorCode::NotFound,
            ShardMemError::Io(_) => ErrorCode::IoError,
            ShardMemError::Communication(_) => ErrorCode::CommunicationError,
        }
    }

    /// Rebuild an error from a code and message received from the rendezvous root.
    pub(crate) fn from_code(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::InvalidInput => ShardMemError::InvalidInput(message),
            ErrorCode::InvalidHandle => ShardMemError::InvalidHandle(message),
            ErrorCode::NotSupported => ShardMemError::NotSupported(message),
            ErrorCode::NotImplemented => ShardMemError::NotImplemented(message),
            ErrorCode::ResourceExhausted => ShardMemError::ResourceExhausted(message),
            ErrorCode::Timeout => ShardMemError::Timeout(message),
            ErrorCode::LogicError | ErrorCode::Success => ShardMemError::Logic(message),
            ErrorCode::SizeMismatch => ShardMemError::SizeMismatch {
                what: message,
                expected: 0,
                actual: 0,
            },
            ErrorCode::NotFound => ShardMemError::NotFound(PathBuf::from(message)),
            ErrorCode::IoError => {
                ShardMemError::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
            }
            ErrorCode::CommunicationError => ShardMemError::Communication(message),
        }
    }
}

/// Result type alias for shardmem operations.
pub type Result<T> = std::result::Result<T, ShardMemError>;

/// Result code of an operation outcome, `Success` for `Ok`.
pub fn code_of<T>(result: &Result<T>) -> ErrorCode {
    match result {
        Ok(_) => ErrorCode::Success,
        Err(e) => e.code(),
    }
}

impl From<toml::ser::Error> for ShardMemError {
    fn from(e: toml::ser::Error) -> Self {
        ShardMemError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ShardMemError {
    fn from(e: toml::de::Error) -> Self {
        ShardMemError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShardMemError::InvalidInput("granularity must be non-zero".to_string());
        assert_eq!(err.to_string(), "Invalid input: granularity must be non-zero");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ShardMemError = io_err.into();
        assert!(err.to_string().contains("IO error"));
        assert_eq!(err.code(), ErrorCode::IoError);
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(
            ShardMemError::Config("bad".into()).code(),
            ErrorCode::InvalidInput
        );
        assert_eq!(
            ShardMemError::Logic("live allocations".into()).code(),
            ErrorCode::LogicError
        );
        assert_eq!(
            ShardMemError::SizeMismatch {
                what: "records".into(),
                expected: 4,
                actual: 3
            }
            .code(),
            ErrorCode::SizeMismatch
        );
        assert_eq!(
            ShardMemError::NotFound(PathBuf::from("/nope")).code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_code_of() {
        let ok: Result<u32> = Ok(1);
        assert_eq!(code_of(&ok), ErrorCode::Success);

        let err: Result<u32> = Err(ShardMemError::Timeout("barrier".into()));
        assert_eq!(code_of(&err), ErrorCode::Timeout);
    }

    #[test]
    fn test_from_code_preserves_category() {
        for code in [
            ErrorCode::InvalidInput,
            ErrorCode::InvalidHandle,
            ErrorCode::NotSupported,
            ErrorCode::Timeout,
            ErrorCode::CommunicationError,
        ] {
            assert_eq!(ShardMemError::from_code(code, "x".into()).code(), code);
        }
    }
}
