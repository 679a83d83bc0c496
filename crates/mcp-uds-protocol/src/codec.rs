//! Line codec: one JSON-RPC message per line of UTF-8 text.

use thiserror::Error;

use crate::MAX_MESSAGE_SIZE;
use crate::jsonrpc::JsonRpcMessage;

/// Errors produced while turning a line into a message or back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The line was empty after trimming.
    #[error("empty message line")]
    Empty,

    /// The line exceeds the configured maximum message size.
    #[error("message size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    TooLarge {
        /// Actual size in bytes
        size: usize,
        /// Configured limit in bytes
        max: usize,
    },

    /// JSON-RPC batches are not part of the protocol.
    #[error("JSON-RPC batches are not supported")]
    BatchNotSupported,

    /// The line is not a valid JSON-RPC message, or a message could not be encoded.
    #[error("invalid JSON-RPC message: {0}")]
    Json(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Line codec with a configurable size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCodec {
    max_message_size: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl LineCodec {
    /// Create a codec that rejects lines longer than `max_message_size` bytes.
    pub const fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// The configured size limit in bytes.
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Parse one received line into a message.
    ///
    /// Surrounding whitespace (including a trailing `\r`) is ignored.
    pub fn decode(&self, line: &str) -> CodecResult<JsonRpcMessage> {
        if line.len() > self.max_message_size {
            return Err(CodecError::TooLarge {
                size: line.len(),
                max: self.max_message_size,
            });
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(CodecError::Empty);
        }
        if trimmed.starts_with('[') {
            return Err(CodecError::BatchNotSupported);
        }

        Ok(serde_json::from_str(trimmed)?)
    }

    /// Serialize a message into a single line, without the trailing newline.
    pub fn encode(&self, message: &JsonRpcMessage) -> CodecResult<String> {
        // Compact serde_json output escapes control characters inside strings,
        // so the result never contains a raw newline.
        let line = serde_json::to_string(message)?;
        if line.len() > self.max_message_size {
            return Err(CodecError::TooLarge {
                size: line.len(),
                max: self.max_message_size,
            });
        }
        debug_assert!(!line.contains('\n'));
        Ok(line)
    }
}

/// Parse one line with the default size limit.
pub fn decode_line(line: &str) -> CodecResult<JsonRpcMessage> {
    LineCodec::default().decode(line)
}

/// Encode one message with the default size limit.
pub fn encode_line(message: &JsonRpcMessage) -> CodecResult<String> {
    LineCodec::default().encode(message)
}
