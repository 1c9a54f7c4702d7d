//! Error types for the protocol crate.

use thiserror::Error;

/// Broad category of a [`ProtocolError`].
///
/// Callers use the kind to tell "the data was malformed" apart from "the data
/// was tampered with or the keys are wrong", and to decide whether an error
/// is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed base64, JSON or timestamp text.
    Format,
    /// Caller or data contract violation (bad key length, missing field,
    /// unknown message type, truncated ciphertext).
    Argument,
    /// Authentication failure while opening a sealed payload.
    Crypto,
    /// Operation not valid in the current client state.
    State,
    /// Transport establishment or loss.
    Connection,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Format => "format",
            ErrorKind::Argument => "argument",
            ErrorKind::Crypto => "crypto",
            ErrorKind::State => "state",
            ErrorKind::Connection => "connection",
        };
        f.write_str(name)
    }
}

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Format errors
    /// Input text could not be decoded (base64, JSON, timestamp).
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    // Argument errors
    /// A value violates the caller contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A key or buffer has the wrong length.
    #[error("invalid {what} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// What was being decoded.
        what: &'static str,
        /// Required length.
        expected: usize,
        /// Actual length.
        got: usize,
    },

    /// A required wire field is absent.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The `type` field is not part of the closed message-type set.
    #[error("unknown message type: {0:?}")]
    UnknownMessageType(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // State errors
    /// Operation attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The client was disposed; no further operations are accepted.
    #[error("client already disposed")]
    Disposed,

    // Connection errors
    /// The transport could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl ProtocolError {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::InvalidFormat(_) => ErrorKind::Format,
            ProtocolError::InvalidArgument(_)
            | ProtocolError::InvalidLength { .. }
            | ProtocolError::MissingField(_)
            | ProtocolError::UnknownMessageType(_) => ErrorKind::Argument,
            ProtocolError::Encryption(_) | ProtocolError::Decryption(_) => ErrorKind::Crypto,
            ProtocolError::InvalidState(_) | ProtocolError::Disposed => ErrorKind::State,
            ProtocolError::ConnectionFailed(_)
            | ProtocolError::ConnectionClosed(_)
            | ProtocolError::Timeout(_) => ErrorKind::Connection,
        }
    }

    /// Whether the client retries this error on its own. Only connection
    /// errors are.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::InvalidFormat(format!("malformed JSON: {}", err))
        } else {
            ProtocolError::InvalidArgument(format!("value is not JSON-encodable: {}", err))
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidFormat(format!("malformed base64: {}", err))
    }
}

impl From<chrono::ParseError> for ProtocolError {
    fn from(err: chrono::ParseError) -> Self {
        ProtocolError::InvalidFormat(format!("malformed timestamp: {}", err))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::ConnectionFailed(err.to_string()),
        }
    }
}
