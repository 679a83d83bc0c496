//! # MCP-UDS Transport Traits
//!
//! Shared types for the Unix domain socket transport and the code on either side of it.
//!
//! ## Overview
//!
//! This crate defines:
//! - **Seams**: [`LineChannel`] and [`ChannelEvents`] below the session transport,
//!   [`MessageHandler`] and [`SessionLogic`] above it
//! - **States**: [`SessionState`], [`ClosingState`]
//! - **Errors**: [`TransportError`], [`TransportResult`]
//! - **Metrics**: [`TransportMetrics`], [`AtomicMetrics`]
//! - **Events**: [`TransportEvent`], [`TransportEventEmitter`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use mcp_uds_protocol::JsonRpcMessage;
//! use mcp_uds_transport_traits::{MessageHandler, TransportResult};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     async fn handle(&self, msg: JsonRpcMessage) -> TransportResult<Option<JsonRpcMessage>> {
//!         Ok(Some(msg))
//!     }
//! }
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
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

mod error;
mod events;
mod metrics;
mod traits;
mod types;

pub use error::{TransportError, TransportResult};
pub use events::{TransportEvent, TransportEventEmitter};
pub use metrics::{AtomicMetrics, TransportMetrics};
pub use traits::{ChannelEvents, FnHandler, LineChannel, MessageHandler, SessionLogic};
pub use types::{ClosingState, SessionState};
