//! # MCP-UDS Protocol
//!
//! JSON-RPC 2.0 message model and line codec for MCP over Unix domain sockets.
//!
//! The socket transport treats every message as opaque once it has been parsed.
//! This crate supplies the two things the transport does need to know:
//!
//! - **Message model**: [`JsonRpcMessage`] and its request/response/notification shapes
//! - **Line codec**: [`encode_line`] / [`decode_line`], where one message is exactly one
//!   line of UTF-8 text with no embedded newline
//!
//! ## Usage
//!
//! ```rust
//! use mcp_uds_protocol::{JsonRpcMessage, decode_line, encode_line};
//!
//! let ping = JsonRpcMessage::request("ping", None, 1);
//! let line = encode_line(&ping).unwrap();
//! assert!(!line.contains('\n'));
//!
//! let decoded = decode_line(&line).unwrap();
//! assert_eq!(decoded.method(), Some("ping"));
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

mod codec;
mod jsonrpc;

pub use codec::{CodecError, CodecResult, LineCodec, decode_line, encode_line};
pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload, JsonRpcVersion, RequestId,
};

/// Maximum size of a single message line in bytes (1MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// MCP protocol revision advertised by the socket transport.
pub const PROTOCOL_VERSION_2024_11_05: &str = "2024-11-05";
