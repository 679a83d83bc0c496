//! # MCP Unix Domain Socket Transport
//!
//! Carries one MCP session over a Unix domain socket, one JSON-RPC message per line.
//!
//! This crate provides:
//!
//! - **Server Mode**: [`UnixServerTransportProvider`] listens for a single client and,
//!   when configured to, starts a fresh session after the client disconnects
//! - **Client Mode**: [`UnixClientTransport`] connects to a listening server
//! - **Ordered Delivery**: one writer per connection, messages written in enqueue order
//! - **Readiness Gating**: sends complete only once both directions are attached
//! - **Graceful Shutdown**: bounded grace period for in-flight writes, socket cleanup
//! - **Message Framing**: `LinesCodec` for newline-delimited JSON
//!
//! ## Quick Start
//!
//! ### Server Mode
//!
//! ```rust,ignore
//! use mcp_uds::{FnHandler, JsonRpcMessage, TransportError, UnixServerTransportProvider, UnixTransportBuilder};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = UnixTransportBuilder::new_server()
//!         .socket_path("/tmp/my-mcp.sock")
//!         .permissions(0o600)
//!         .config()
//!         .clone();
//!     let provider = UnixServerTransportProvider::bind(config).await?;
//!
//!     provider
//!         .attach_handler(FnHandler::new(|msg: JsonRpcMessage| async move {
//!             let reply = msg.id().cloned().map(|id| JsonRpcMessage::success(json!("pong"), id));
//!             Ok::<_, TransportError>(reply)
//!         }))
//!         .await?; // Starts listening
//!
//!     tokio::signal::ctrl_c().await?;
//!     provider.close_gracefully().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Client Mode
//!
//! ```rust,ignore
//! use mcp_uds::{FnHandler, JsonRpcMessage, TransportError, UnixTransportBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = UnixTransportBuilder::new_client()
//!         .socket_path("/tmp/my-mcp.sock")
//!         .build_client()?;
//!
//!     client
//!         .connect(FnHandler::new(|msg: JsonRpcMessage| async move {
//!             println!("{msg:?}");
//!             Ok::<_, TransportError>(None)
//!         }))
//!         .await?;
//!     client.send_message(JsonRpcMessage::request("ping", None, 1_i64)).await?;
//!     client.close_gracefully().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Connection generations
//!
//! Every physical connection gets its own generation: a line channel, an
//! outbound pipe with its writer task, an inbound pipe with its dispatch loop,
//! a readiness gate and a closing flag. A restart retires the whole generation
//! and builds a new one, so nothing queued for one peer reaches the next.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_panics_doc,
    clippy::default_trait_access
)]

mod channel;
mod client;
mod closing;
mod config;
mod gate;
mod generation;
mod pipe;
mod server;
mod session;

#[cfg(test)]
mod testing;

pub use channel::{ChannelFactory, UnixLineChannel, unix_channel_factory};
pub use client::UnixClientTransport;
pub use closing::ClosingFlag;
pub use crate::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CLOSE_GRACE_PERIOD, ENV_BUFFER_SIZE, ENV_PREFIX, ENV_RESTART,
    ENV_SOCKET_PATH, UnixConfig, UnixTransportBuilder,
};
pub use gate::ReadinessGate;
pub use generation::GenerationId;
pub use pipe::{DeliveryReceipt, InboundPipe, OutboundPipe};
pub use server::UnixServerTransportProvider;
pub use session::{HandlerSession, SessionHandle};

pub use mcp_uds_protocol::{JsonRpcError, JsonRpcMessage, LineCodec, MAX_MESSAGE_SIZE, RequestId};
pub use mcp_uds_transport_traits::{
    ChannelEvents, FnHandler, LineChannel, MessageHandler, SessionLogic, SessionState,
    TransportError, TransportEvent, TransportEventEmitter, TransportMetrics, TransportResult,
};
