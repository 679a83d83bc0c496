//! What the session logic holds to talk back to its peer.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use mcp_uds_protocol::JsonRpcMessage;
use mcp_uds_transport_traits::{
    MessageHandler, SessionLogic, TransportError, TransportResult,
};
use serde_json::Value;

use crate::generation::Generation;
use crate::server::ProviderInner;

/// Sender handed to the session-logic factory of a server provider.
///
/// Every call resolves the generation that is current at that moment, so a
/// message sent after a restart goes to the new peer and never to the old one.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Weak<ProviderInner>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(inner: Weak<ProviderInner>) -> Self {
        Self { inner }
    }

    fn provider(&self) -> TransportResult<Arc<ProviderInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| TransportError::NoActiveSession("provider has been dropped".into()))
    }

    fn current(&self) -> TransportResult<Arc<Generation>> {
        self.provider()?
            .current_generation()
            .ok_or_else(|| TransportError::NoActiveSession("provider is not listening".into()))
    }

    /// Send `message` through the current generation.
    ///
    /// Completes once the message has been written. Before a peer is accepted
    /// the message waits in the outbound queue.
    pub async fn send_message(&self, message: JsonRpcMessage) -> TransportResult<()> {
        self.current()?.send_message(message).await
    }

    /// Send a notification through the current generation.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> TransportResult<()> {
        self.send_message(JsonRpcMessage::notification(method, params))
            .await
    }

    /// Shut the provider down for good. Restart is disabled first.
    pub async fn close_gracefully(&self) -> TransportResult<()> {
        if let Some(provider) = self.inner.upgrade() {
            provider.shutdown().await;
        }
        Ok(())
    }

    /// Whether a peer is attached to the current generation.
    pub fn is_client_connected(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|provider| provider.is_client_connected())
    }
}

/// [`SessionLogic`] built from a plain [`MessageHandler`] and a [`SessionHandle`].
pub struct HandlerSession<H> {
    handler: H,
    handle: SessionHandle,
}

impl<H> fmt::Debug for HandlerSession<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSession")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl<H: MessageHandler> HandlerSession<H> {
    /// Pair `handler` with the provider behind `handle`.
    pub fn new(handler: H, handle: SessionHandle) -> Self {
        Self { handler, handle }
    }

    /// The handle this session sends through.
    pub fn session_handle(&self) -> &SessionHandle {
        &self.handle
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for HandlerSession<H> {
    async fn handle(&self, message: JsonRpcMessage) -> TransportResult<Option<JsonRpcMessage>> {
        self.handler.handle(message).await
    }
}

#[async_trait]
impl<H: MessageHandler> SessionLogic for HandlerSession<H> {
    async fn send_notification(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        self.handle.send_notification(method, params).await
    }

    async fn close_gracefully(&self) -> TransportResult<()> {
        self.handle.close_gracefully().await
    }
}
