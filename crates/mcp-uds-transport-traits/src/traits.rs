//! Seams between the line channel, the session transport and the session logic.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use mcp_uds_protocol::JsonRpcMessage;
use serde_json::Value;

use crate::error::{TransportError, TransportResult};

/// Callbacks a [`LineChannel`] invokes as its connection progresses.
///
/// Implementations run on the channel's own I/O task and must never block:
/// they only record state and enqueue.
pub trait ChannelEvents: Send + Sync {
    /// A peer was accepted (server) or the connect completed (client).
    fn on_connected(&self);

    /// One complete line arrived, without its terminator.
    ///
    /// Returning an error makes the channel stop reading and report the
    /// error through [`ChannelEvents::on_error`].
    fn on_line(&self, line: String) -> TransportResult<()>;

    /// The connection failed or ended. Called at most once per channel.
    fn on_error(&self, error: TransportError);
}

/// A stream socket that carries one text line per message.
///
/// A channel serves one physical connection. After [`LineChannel::close`] or a
/// reported error it is spent and a new channel must be created.
#[async_trait]
pub trait LineChannel: Send + Sync + fmt::Debug {
    /// Bind and listen, then accept a single peer in the background.
    ///
    /// Returns once the listener is bound. Bind failures are returned
    /// directly; later accept and read failures go to `events`.
    async fn start(&self, events: Arc<dyn ChannelEvents>) -> TransportResult<()>;

    /// Connect to a listening peer and start reading in the background.
    ///
    /// Returns once connected. `on_connected` has fired by then.
    async fn connect(&self, events: Arc<dyn ChannelEvents>) -> TransportResult<()>;

    /// Write one line and its terminator. Writes never interleave.
    async fn write_message(&self, line: &str) -> TransportResult<()>;

    /// Close the connection and any listener. Idempotent.
    async fn close(&self);

    /// Returns `true` while a peer is attached.
    fn is_connected(&self) -> bool;
}

/// Consumer of inbound messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message.
    ///
    /// A returned message is sent back to the peer on the same session.
    async fn handle(&self, message: JsonRpcMessage) -> TransportResult<Option<JsonRpcMessage>>;
}

/// The RPC session logic bound to a server session.
#[async_trait]
pub trait SessionLogic: MessageHandler {
    /// Send a notification to the connected peer.
    async fn send_notification(&self, method: &str, params: Option<Value>) -> TransportResult<()>;

    /// Shut the session down.
    async fn close_gracefully(&self) -> TransportResult<()>;
}

#[async_trait]
impl<T: MessageHandler + ?Sized> MessageHandler for Arc<T> {
    async fn handle(&self, message: JsonRpcMessage) -> TransportResult<Option<JsonRpcMessage>> {
        (**self).handle(message).await
    }
}

/// Adapts an async closure into a [`MessageHandler`].
///
/// ```rust
/// use mcp_uds_protocol::JsonRpcMessage;
/// use mcp_uds_transport_traits::{FnHandler, TransportError};
/// use serde_json::json;
///
/// let handler = FnHandler::new(|msg: JsonRpcMessage| async move {
///     let reply = msg.id().cloned().map(|id| JsonRpcMessage::success(json!("pong"), id));
///     Ok::<_, TransportError>(reply)
/// });
/// # let _ = handler;
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(JsonRpcMessage) -> Fut + Send + Sync,
    Fut: Future<Output = TransportResult<Option<JsonRpcMessage>>> + Send,
{
    async fn handle(&self, message: JsonRpcMessage) -> TransportResult<Option<JsonRpcMessage>> {
        (self.f)(message).await
    }
}
