//! Error types for the SMB2 client connection core

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for SMB2 client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the connection core.
///
/// Errors are `Clone` so a single transport failure can be propagated to
/// every caller with an outstanding request; the underlying I/O error is
/// shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Underlying byte-stream I/O failure; fatal to the connection
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// Caller-requested cancellation; local to the caller
    #[error("operation canceled")]
    Canceled,

    /// Malformed frame, unexpected dialect, unknown session/tree/message id,
    /// or signature mismatch
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Encoding failure, crypto failure on send, RNG failure
    #[error("internal error: {0}")]
    Internal(String),

    /// Non-success NTSTATUS that is not mapped to a common case
    #[error(transparent)]
    Response(ResponseError),

    /// STATUS_OBJECT_NAME_COLLISION
    #[error("object already exists")]
    AlreadyExists,

    /// STATUS_OBJECT_NAME_NOT_FOUND / STATUS_OBJECT_PATH_NOT_FOUND
    #[error("object not found")]
    NotFound,

    /// STATUS_ACCESS_DENIED / STATUS_CANNOT_DELETE
    #[error("permission denied")]
    PermissionDenied,

    /// Send attempted after the connection was shut down
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(Arc::new(e))
    }
}

/// Structured server error carrying the raw 32-bit NTSTATUS and any
/// error-context payloads from the SMB2 ERROR response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub code: u32,
    pub data: Vec<Vec<u8>>,
}

impl ResponseError {
    pub fn new(code: u32) -> Self {
        Self {
            code,
            data: Vec::new(),
        }
    }

    pub fn with_data(code: u32, data: Vec<Vec<u8>>) -> Self {
        Self { code, data }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server responded with status 0x{:08X}", self.code)
    }
}

impl std::error::Error for ResponseError {}

impl From<ResponseError> for Error {
    fn from(e: ResponseError) -> Self {
        Error::Response(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_error_display() {
        let err = ResponseError::new(0xC0000022);
        let display = format!("{}", err);
        assert!(display.contains("0xC0000022"));
    }

    #[test]
    fn test_transport_error_clone() {
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        let cloned = err.clone();
        assert!(matches!(cloned, Error::Transport(_)));
        assert_eq!(format!("{}", err), format!("{}", cloned));
    }

    #[test]
    fn test_error_variants_distinguishable() {
        assert!(matches!(Error::Canceled, Error::Canceled));
        let resp: Error = ResponseError::new(0xC00000BB).into();
        match resp {
            Error::Response(e) => assert_eq!(e.code, 0xC00000BB),
            _ => panic!("expected response error"),
        }
    }
}
