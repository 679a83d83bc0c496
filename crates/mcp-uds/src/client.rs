//! Client transport: one connection, no restart.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mcp_uds_protocol::{JsonRpcMessage, LineCodec};
use mcp_uds_transport_traits::{
    AtomicMetrics, MessageHandler, SessionState, TransportError, TransportEvent,
    TransportEventEmitter, TransportMetrics, TransportResult,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::channel::{ChannelFactory, unix_channel_factory};
use crate::config::UnixConfig;
use crate::generation::{Generation, GenerationContext, GenerationId};

/// Connects to a listening server socket and carries one session.
///
/// Any failure of the connection is terminal: the transport closes and does
/// not reconnect.
pub struct UnixClientTransport {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for UnixClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixClientTransport")
            .field("socket_path", &self.inner.config.socket_path)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    config: UnixConfig,
    codec: LineCodec,
    channel_factory: ChannelFactory,
    generation: Mutex<Option<Arc<Generation>>>,
    closed: AtomicBool,
    /// Serializes connect and close.
    lifecycle: tokio::sync::Mutex<()>,
    metrics: Arc<AtomicMetrics>,
    events: TransportEventEmitter,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl UnixClientTransport {
    /// Create a client for `config.socket_path`. Nothing is connected yet.
    pub fn new(config: UnixConfig) -> TransportResult<Self> {
        Self::with_channel_factory(config, unix_channel_factory())
    }

    /// Create a client whose connection uses a channel from `factory`.
    pub fn with_channel_factory(
        config: UnixConfig,
        channel_factory: ChannelFactory,
    ) -> TransportResult<Self> {
        config.validate()?;
        let (events, event_rx) = TransportEventEmitter::new();
        Ok(Self {
            inner: Arc::new(ClientInner {
                codec: LineCodec::new(config.max_message_size),
                config,
                channel_factory,
                generation: Mutex::new(None),
                closed: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                metrics: Arc::new(AtomicMetrics::new()),
                events,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        })
    }

    /// Connect and start feeding inbound messages to `handler`.
    ///
    /// The handler is wired before the socket is connected, so nothing the
    /// server sends first is missed. A failed connect closes the transport.
    pub async fn connect<H>(&self, handler: H) -> TransportResult<()>
    where
        H: MessageHandler + 'static,
    {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if inner.generation.lock().is_some() {
            return Err(TransportError::ConfigurationError(
                "client is already connected".into(),
            ));
        }

        let channel = (inner.channel_factory)(&inner.config);
        let generation = Generation::new(GenerationId::FIRST, channel, inner.generation_context());
        generation.spawn_dispatch(Arc::new(handler));
        *inner.generation.lock() = Some(Arc::clone(&generation));

        if let Err(err) = generation.connect().await {
            error!(path = ?inner.config.socket_path, error = %err, "failed to connect");
            inner.metrics.failed_connections.fetch_add(1, Ordering::Relaxed);
            inner.events.emit_error(err.clone(), Some("connect".into()));
            generation.close().await;
            inner.mark_closed();
            return Err(err);
        }
        info!(path = ?inner.config.socket_path, "connected to server");
        Ok(())
    }

    /// Send `message` and wait until it has been written.
    pub async fn send_message(&self, message: JsonRpcMessage) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let generation = self.inner.generation.lock().clone();
        let Some(generation) = generation else {
            return Err(TransportError::NotConnected);
        };
        generation.send_message(message).await
    }

    /// Send a notification and wait until it has been written.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        self.send_message(JsonRpcMessage::notification(method, params))
            .await
    }

    /// Close the connection. Idempotent.
    pub async fn close_gracefully(&self) -> TransportResult<()> {
        self.inner.close().await;
        Ok(())
    }

    /// Whether the connection is up and not closing.
    pub fn is_connected(&self) -> bool {
        self.inner
            .generation
            .lock()
            .as_ref()
            .is_some_and(|generation| generation.is_live())
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Messages queued on the connection but not yet written or failed.
    pub fn pending_outbound(&self) -> usize {
        self.inner
            .generation
            .lock()
            .as_ref()
            .map_or(0, |generation| generation.pending_outbound())
    }

    /// Connection counters.
    pub fn metrics(&self) -> TransportMetrics {
        self.inner.metrics.snapshot()
    }

    /// The server socket path.
    pub fn socket_path(&self) -> &Path {
        &self.inner.config.socket_path
    }

    /// Lifecycle events. Only the first call gets the receiver.
    pub fn subscribe_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inner.event_rx.lock().take()
    }
}

impl ClientInner {
    fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            return SessionState::Closed;
        }
        self.generation
            .lock()
            .as_ref()
            .map_or(SessionState::Initializing, |generation| generation.state())
    }

    fn generation_context(self: &Arc<Self>) -> GenerationContext {
        let client = Arc::downgrade(self);
        GenerationContext {
            codec: self.codec,
            grace_period: self.config.close_grace_period,
            metrics: Arc::clone(&self.metrics),
            events: self.events.clone(),
            on_fatal: Arc::new(move |_id, _error| {
                // Already logged by the generation; the client just closes.
                if let Some(client) = client.upgrade() {
                    tokio::spawn(async move { client.close().await });
                }
            }),
            ever_attached: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let generation = self.generation.lock().clone();
        if let Some(generation) = generation {
            generation.close().await;
        }
        self.mark_closed();
        info!(path = ?self.config.socket_path, "client transport closed");
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.events.emit_closed();
        }
    }
}
