//! Transport error types.

use mcp_uds_protocol::{CodecError, JsonRpcError, JsonRpcErrorCode};
use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors that can occur during transport operations.
///
/// The variants follow the failure classes of a session:
/// enqueue failures are reported to the caller only, serialization and
/// write failures are fatal to the current generation, bind and restart
/// failures are fatal to the whole provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// A message could not be queued because its pipe was already completed.
    #[error("Failed to enqueue message: {0}")]
    EnqueueFailed(String),

    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to write a message to the peer.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to bind or listen on the socket path.
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The session could not be restarted after a disconnect.
    #[error("Restart failed: {0}")]
    RestartFailed(String),

    /// No peer session is available to carry the operation.
    #[error("No active session: {0}")]
    NoActiveSession(String),

    /// The transport has not been connected yet.
    #[error("Transport not connected")]
    NotConnected,

    /// The transport or session has been closed.
    #[error("Transport closed")]
    Closed,

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<TransportError> for JsonRpcError {
    fn from(err: TransportError) -> Self {
        let code = match &err {
            TransportError::SerializationFailed(_) => JsonRpcErrorCode::ParseError,
            TransportError::ConfigurationError(_) => JsonRpcErrorCode::InvalidParams,
            _ => JsonRpcErrorCode::InternalError,
        };
        JsonRpcError::new(code.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone").into();
        assert!(matches!(err, TransportError::Io(ref m) if m.contains("pipe gone")));
    }

    #[test]
    fn test_codec_error_is_serialization_failure() {
        let err: TransportError = CodecError::BatchNotSupported.into();
        assert!(matches!(err, TransportError::SerializationFailed(ref m) if m.contains("batch")));
    }

    #[test]
    fn test_jsonrpc_error_mapping() {
        let rpc: JsonRpcError = TransportError::SerializationFailed("bad".into()).into();
        assert_eq!(rpc.code, -32700);
        let rpc: JsonRpcError = TransportError::Closed.into();
        assert_eq!(rpc.code, -32603);
        assert_eq!(rpc.message, "Transport closed");
    }
}
