//! Server transport provider: one listening session, restarted after a disconnect.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mcp_uds_protocol::{LineCodec, PROTOCOL_VERSION_2024_11_05};
use mcp_uds_transport_traits::{
    AtomicMetrics, MessageHandler, SessionLogic, SessionState, TransportError, TransportEvent,
    TransportEventEmitter, TransportMetrics, TransportResult,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelFactory, unix_channel_factory};
use crate::config::UnixConfig;
use crate::generation::{Generation, GenerationContext, GenerationId};
use crate::session::{HandlerSession, SessionHandle};

const PROTOCOL_VERSIONS: &[&str] = &[PROTOCOL_VERSION_2024_11_05];

/// Serves one MCP session over a Unix socket.
///
/// The provider listens for a single peer at a time. When that peer goes away
/// unexpectedly and `restart_on_disconnect` is set, the current generation is
/// torn down and a fresh one listens at the same path. Otherwise, or after
/// [`close_gracefully`](Self::close_gracefully), the provider is closed for good.
pub struct UnixServerTransportProvider {
    inner: Arc<ProviderInner>,
}

impl fmt::Debug for UnixServerTransportProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixServerTransportProvider")
            .field("socket_path", &self.inner.config.socket_path)
            .field("state", &self.inner.state())
            .field("generation", &self.inner.current_generation().map(|g| g.id()))
            .finish_non_exhaustive()
    }
}

pub(crate) struct ProviderInner {
    config: UnixConfig,
    codec: LineCodec,
    channel_factory: ChannelFactory,
    current: Mutex<Option<Arc<Generation>>>,
    /// Serializes attach, restart and shutdown.
    restart_lock: tokio::sync::Mutex<()>,
    restart_enabled: AtomicBool,
    state: Mutex<SessionState>,
    next_generation: Mutex<GenerationId>,
    ever_attached: Arc<AtomicBool>,
    session: Mutex<Option<Arc<dyn SessionLogic>>>,
    metrics: Arc<AtomicMetrics>,
    events: TransportEventEmitter,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl UnixServerTransportProvider {
    /// Create a provider. Nothing is bound until session logic is attached.
    pub fn new(config: UnixConfig) -> TransportResult<Self> {
        Self::with_channel_factory(config, unix_channel_factory())
    }

    /// Create a provider whose generations use channels from `factory`.
    pub fn with_channel_factory(
        config: UnixConfig,
        channel_factory: ChannelFactory,
    ) -> TransportResult<Self> {
        config.validate()?;
        let (events, event_rx) = TransportEventEmitter::new();
        let restart = config.restart_on_disconnect;
        Ok(Self {
            inner: Arc::new(ProviderInner {
                codec: LineCodec::new(config.max_message_size),
                config,
                channel_factory,
                current: Mutex::new(None),
                restart_lock: tokio::sync::Mutex::new(()),
                restart_enabled: AtomicBool::new(restart),
                state: Mutex::new(SessionState::Initializing),
                next_generation: Mutex::new(GenerationId::FIRST),
                ever_attached: Arc::new(AtomicBool::new(false)),
                session: Mutex::new(None),
                metrics: Arc::new(AtomicMetrics::new()),
                events,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        })
    }

    /// Create a provider and remove any stale node left at the socket path.
    pub async fn bind(config: UnixConfig) -> TransportResult<Self> {
        let provider = Self::new(config)?;
        remove_socket_node(provider.socket_path()).await?;
        Ok(provider)
    }

    /// Create the session logic and start listening.
    ///
    /// `factory` receives the [`SessionHandle`] the logic uses to reach its peer.
    /// Session logic can be attached once per provider. A bind failure closes
    /// the provider and is returned here.
    pub async fn attach_session_logic<F>(&self, factory: F) -> TransportResult<()>
    where
        F: FnOnce(SessionHandle) -> Arc<dyn SessionLogic> + Send,
    {
        let inner = &self.inner;
        let _guard = inner.restart_lock.lock().await;
        if inner.state() == SessionState::Closed {
            return Err(TransportError::Closed);
        }
        if inner.session.lock().is_some() {
            return Err(TransportError::ConfigurationError(
                "session logic is already attached".into(),
            ));
        }

        let logic = factory(SessionHandle::new(Arc::downgrade(inner)));
        *inner.session.lock() = Some(logic);

        if let Err(err) = inner.start_generation().await {
            error!(path = ?inner.config.socket_path, error = %err, "failed to start listening");
            inner.events.emit_error(err.clone(), Some("bind".into()));
            inner.finish_closed().await;
            return Err(err);
        }
        Ok(())
    }

    /// Attach a plain message handler as the session logic.
    pub async fn attach_handler<H>(&self, handler: H) -> TransportResult<()>
    where
        H: MessageHandler + 'static,
    {
        self.attach_session_logic(move |handle| {
            Arc::new(HandlerSession::new(handler, handle)) as Arc<dyn SessionLogic>
        })
        .await
    }

    /// Send a notification to the connected peer through the session logic.
    ///
    /// Fails with [`TransportError::NoActiveSession`] when the provider is
    /// closed or no peer has ever connected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        let inner = &self.inner;
        if inner.state() == SessionState::Closed {
            return Err(TransportError::NoActiveSession("provider is closed".into()));
        }
        if !inner.ever_attached.load(Ordering::Acquire) {
            return Err(TransportError::NoActiveSession(
                "no client has connected yet".into(),
            ));
        }
        let session = inner.session.lock().clone();
        let Some(session) = session else {
            return Err(TransportError::NoActiveSession(
                "no session logic attached".into(),
            ));
        };
        session.send_notification(method, params).await
    }

    /// Disable restart, let the session logic close, and tear the provider down.
    ///
    /// Always completes, even if the connection is already broken. Idempotent.
    pub async fn close_gracefully(&self) -> TransportResult<()> {
        self.inner.restart_enabled.store(false, Ordering::Release);
        let session = self.inner.session.lock().clone();
        if let Some(session) = session
            && let Err(err) = session.close_gracefully().await
        {
            warn!(error = %err, "session logic failed to close");
        }
        self.inner.shutdown().await;
        Ok(())
    }

    /// Whether a peer is attached to the current generation.
    pub fn is_client_connected(&self) -> bool {
        self.inner.is_client_connected()
    }

    /// Provider state, or the current generation's state while running.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// The current generation, if one is listening or connected.
    pub fn generation(&self) -> Option<GenerationId> {
        self.inner.current_generation().map(|g| g.id())
    }

    /// Counters across all generations.
    pub fn metrics(&self) -> TransportMetrics {
        self.inner.metrics.snapshot()
    }

    /// The configured socket path.
    pub fn socket_path(&self) -> &Path {
        &self.inner.config.socket_path
    }

    /// Configuration this provider was built with.
    pub fn config(&self) -> &UnixConfig {
        &self.inner.config
    }

    /// MCP protocol versions this transport advertises.
    pub fn protocol_versions(&self) -> &'static [&'static str] {
        PROTOCOL_VERSIONS
    }

    /// Lifecycle events. Only the first call gets the receiver.
    pub fn subscribe_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inner.event_rx.lock().take()
    }
}

impl ProviderInner {
    pub(crate) fn current_generation(&self) -> Option<Arc<Generation>> {
        self.current.lock().clone()
    }

    pub(crate) fn is_client_connected(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|generation| generation.is_live())
    }

    fn state(&self) -> SessionState {
        let state = *self.state.lock();
        match state {
            SessionState::Initializing | SessionState::Ready => self
                .current_generation()
                .map_or(state, |generation| generation.state()),
            other => other,
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn generation_context(self: &Arc<Self>) -> GenerationContext {
        let provider = Arc::downgrade(self);
        GenerationContext {
            codec: self.codec,
            grace_period: self.config.close_grace_period,
            metrics: Arc::clone(&self.metrics),
            events: self.events.clone(),
            on_fatal: Arc::new(move |id, error| {
                if let Some(provider) = provider.upgrade() {
                    tokio::spawn(provider.handle_fatal(id, error));
                }
            }),
            ever_attached: Arc::clone(&self.ever_attached),
        }
    }

    /// Build a new generation and start listening. Caller holds `restart_lock`.
    async fn start_generation(self: &Arc<Self>) -> TransportResult<GenerationId> {
        let session = self.session.lock().clone().ok_or_else(|| {
            TransportError::Internal("no session logic to start a generation for".into())
        })?;
        remove_socket_node(&self.config.socket_path).await?;

        let id = {
            let mut next = self.next_generation.lock();
            let id = *next;
            *next = id.next();
            id
        };
        let channel = (self.channel_factory)(&self.config);
        let generation = Generation::new(id, channel, self.generation_context());
        let handler: Arc<dyn MessageHandler> = session;
        generation.spawn_dispatch(handler);

        *self.current.lock() = Some(Arc::clone(&generation));
        self.set_state(SessionState::Initializing);

        if let Err(err) = generation.listen().await {
            generation.close().await;
            *self.current.lock() = None;
            return Err(err);
        }

        info!(generation = %id, path = ?self.config.socket_path, "listening for a client");
        self.events
            .emit_listening(self.config.socket_path.clone(), id.get());
        Ok(id)
    }

    /// Fatal error reported by generation `id`: restart or close for good.
    async fn handle_fatal(self: Arc<Self>, id: GenerationId, error: TransportError) {
        let _guard = self.restart_lock.lock().await;
        let Some(current) = self.current_generation().filter(|g| g.id() == id) else {
            debug!(generation = %id, error = %error, "ignoring error from a retired generation");
            return;
        };
        self.events
            .emit_error(error.clone(), Some(format!("generation {id}")));

        if !self.restart_enabled.load(Ordering::Acquire) || *self.state.lock() == SessionState::Closed {
            info!(generation = %id, error = %error, "session ended, restart disabled");
            self.set_state(SessionState::Closing);
            current.close().await;
            *self.current.lock() = None;
            self.finish_closed().await;
            return;
        }

        self.set_state(SessionState::Restarting);
        current.close().await;
        self.metrics.restarts.fetch_add(1, Ordering::Relaxed);

        match self.start_generation().await {
            Ok(next) => {
                info!(previous = %id, generation = %next, "session restarted");
                self.events.emit_restarted(id.get(), next.get());
            }
            Err(err) => {
                error!(previous = %id, error = %err, "failed to restart session, provider stays down");
                self.events.emit_error(
                    TransportError::RestartFailed(err.to_string()),
                    Some(format!("after generation {id}")),
                );
                self.finish_closed().await;
            }
        }
    }

    /// Close the current generation and the provider. Idempotent.
    pub(crate) async fn shutdown(&self) {
        self.restart_enabled.store(false, Ordering::Release);
        let _guard = self.restart_lock.lock().await;
        if *self.state.lock() == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::Closing);
        let current = self.current.lock().take();
        if let Some(generation) = current {
            generation.close().await;
        }
        self.finish_closed().await;
    }

    async fn finish_closed(&self) {
        *self.current.lock() = None;
        if self.config.cleanup_on_close
            && let Err(err) = remove_socket_node(&self.config.socket_path).await
        {
            warn!(path = ?self.config.socket_path, error = %err, "failed to remove socket file");
        }
        self.set_state(SessionState::Closed);
        self.events.emit_closed();
        info!(path = ?self.config.socket_path, "server provider closed");
    }
}

/// Remove whatever is at `path`. A missing node is fine.
async fn remove_socket_node(path: &Path) -> TransportResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = ?path, "removed existing socket file");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TransportError::BindFailed(format!(
            "cannot remove existing node at {}: {err}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedFactory, settle, wait_until, within};
    use mcp_uds_protocol::JsonRpcMessage;
    use mcp_uds_transport_traits::FnHandler;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct Fixture {
        provider: UnixServerTransportProvider,
        factory: Arc<ScriptedFactory>,
        _dir: TempDir,
    }

    fn fixture_with(factory: Arc<ScriptedFactory>, restart: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = UnixConfig {
            socket_path: dir.path().join("server.sock"),
            restart_on_disconnect: restart,
            close_grace_period: std::time::Duration::from_millis(50),
            ..UnixConfig::default()
        };
        let provider =
            UnixServerTransportProvider::with_channel_factory(config, factory.factory()).unwrap();
        Fixture {
            provider,
            factory,
            _dir: dir,
        }
    }

    fn fixture(restart: bool) -> Fixture {
        fixture_with(ScriptedFactory::new(), restart)
    }

    fn pong() -> impl MessageHandler + 'static {
        FnHandler::new(|msg: JsonRpcMessage| {
            let reply = match (msg.method(), msg.id()) {
                (Some("ping"), Some(id)) => Some(JsonRpcMessage::success(json!("pong"), id.clone())),
                _ => None,
            };
            std::future::ready(Ok::<_, TransportError>(reply))
        })
    }

    #[tokio::test]
    async fn test_attach_starts_first_generation() {
        let f = fixture(true);
        assert_eq!(f.provider.generation(), None);
        f.provider.attach_handler(pong()).await.unwrap();

        assert_eq!(f.factory.count(), 1);
        assert!(f.factory.channel(0).is_started());
        assert_eq!(f.provider.generation(), Some(GenerationId::FIRST));
        assert_eq!(f.provider.state(), SessionState::Initializing);
        assert!(!f.provider.is_client_connected());

        f.factory.channel(0).accept();
        assert!(f.provider.is_client_connected());
        assert_eq!(f.provider.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_attach_twice_is_rejected() {
        let f = fixture(true);
        f.provider.attach_handler(pong()).await.unwrap();
        let second = f.provider.attach_handler(pong()).await;
        assert!(matches!(second, Err(TransportError::ConfigurationError(_))));
        assert_eq!(f.factory.count(), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_closes_provider() {
        let f = fixture_with(ScriptedFactory::failing_after(0), true);
        let result = f.provider.attach_handler(pong()).await;
        assert!(matches!(result, Err(TransportError::BindFailed(_))));
        assert_eq!(f.provider.state(), SessionState::Closed);
        assert_eq!(f.provider.generation(), None);
    }

    #[tokio::test]
    async fn test_notify_before_any_peer_has_no_session() {
        let f = fixture(true);
        f.provider.attach_handler(pong()).await.unwrap();

        let result = f.provider.notify("notifications/message", None).await;
        assert!(matches!(result, Err(TransportError::NoActiveSession(_))));
        assert!(f.factory.channel(0).writes().is_empty());

        f.factory.channel(0).accept();
        within(f.provider.notify("notifications/message", Some(json!({"level": "info"}))))
            .await
            .unwrap();
        let written: Value = serde_json::from_str(&f.factory.channel(0).writes()[0]).unwrap();
        assert_eq!(written["method"], "notifications/message");
    }

    #[tokio::test]
    async fn test_restart_isolates_generations() {
        let release = Arc::new(Notify::new());
        let gate = Arc::clone(&release);
        let handler = FnHandler::new(move |msg: JsonRpcMessage| {
            let gate = Arc::clone(&gate);
            async move {
                if msg.method() == Some("slow") {
                    gate.notified().await;
                }
                Ok::<_, TransportError>(
                    msg.id()
                        .cloned()
                        .map(|id| JsonRpcMessage::success(json!("done"), id)),
                )
            }
        });

        let f = fixture(true);
        let mut events = f.provider.subscribe_events().unwrap();
        f.provider.attach_handler(handler).await.unwrap();
        let first = f.factory.channel(0);
        first.accept();

        // Request whose reply is produced only after the restart.
        first.push_line(r#"{"jsonrpc":"2.0","id":7,"method":"slow"}"#);
        settle().await;
        first.fail(TransportError::ConnectionLost("peer went away".into()));

        let factory = Arc::clone(&f.factory);
        wait_until(move || factory.count() == 2).await;
        let provider = &f.provider;
        wait_until(|| provider.generation() == Some(GenerationId::FIRST.next())).await;
        let second = f.factory.channel(1);
        assert!(second.is_started());
        second.accept();

        release.notify_one();
        settle().await;
        assert!(first.writes().is_empty());
        assert!(second.writes().is_empty());

        second.push_line(r#"{"jsonrpc":"2.0","id":8,"method":"ping"}"#);
        let channel = Arc::clone(&second);
        wait_until(move || !channel.writes().is_empty()).await;
        let reply: Value = serde_json::from_str(&second.writes()[0]).unwrap();
        assert_eq!(reply["id"], 8);

        let metrics = f.provider.metrics();
        assert_eq!(metrics.restarts, 1);
        assert_eq!(metrics.generations, 2);
        assert_eq!(first.close_calls(), 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&TransportEvent::Restarted {
            previous: 1,
            generation: 2
        }));
    }

    #[tokio::test]
    async fn test_restart_disabled_closes_provider() {
        let f = fixture(false);
        f.provider.attach_handler(pong()).await.unwrap();
        let channel = f.factory.channel(0);
        channel.accept();
        channel.fail(TransportError::ConnectionLost("eof".into()));

        let provider = &f.provider;
        wait_until(|| provider.state() == SessionState::Closed).await;
        let result = within(f.provider.notify("notifications/message", None)).await;
        assert!(matches!(result, Err(TransportError::NoActiveSession(_))));
        assert_eq!(f.factory.count(), 1);
        assert_eq!(channel.close_calls(), 1);
        assert!(!f.provider.socket_path().exists());
    }

    #[tokio::test]
    async fn test_restart_failure_leaves_provider_down() {
        let f = fixture_with(ScriptedFactory::failing_after(1), true);
        f.provider.attach_handler(pong()).await.unwrap();
        f.factory.channel(0).accept();
        f.factory
            .channel(0)
            .fail(TransportError::ConnectionLost("eof".into()));

        let provider = &f.provider;
        wait_until(|| provider.state() == SessionState::Closed).await;
        assert_eq!(f.factory.count(), 2);
        assert_eq!(f.provider.generation(), None);
    }

    #[tokio::test]
    async fn test_stale_fatal_report_is_ignored() {
        let f = fixture(true);
        f.provider.attach_handler(pong()).await.unwrap();
        f.factory.channel(0).accept();
        f.factory
            .channel(0)
            .fail(TransportError::ConnectionLost("eof".into()));
        let provider = &f.provider;
        wait_until(|| provider.generation() == Some(GenerationId::FIRST.next())).await;

        Arc::clone(&f.provider.inner)
            .handle_fatal(
                GenerationId::FIRST,
                TransportError::SendFailed("late".into()),
            )
            .await;

        assert_eq!(f.provider.generation(), Some(GenerationId::FIRST.next()));
        assert_eq!(f.factory.count(), 2);
        assert_eq!(f.factory.channel(1).close_calls(), 0);
        assert_eq!(f.provider.metrics().restarts, 1);
    }

    #[tokio::test]
    async fn test_close_gracefully_is_idempotent() {
        let f = fixture(true);
        let mut events = f.provider.subscribe_events().unwrap();
        assert!(f.provider.subscribe_events().is_none());
        f.provider.attach_handler(pong()).await.unwrap();
        let channel = f.factory.channel(0);
        channel.accept();

        within(f.provider.close_gracefully()).await.unwrap();
        within(f.provider.close_gracefully()).await.unwrap();

        assert_eq!(f.provider.state(), SessionState::Closed);
        assert!(!f.provider.is_client_connected());
        assert_eq!(channel.close_calls(), 1);
        assert_eq!(f.factory.count(), 1);
        let metrics = f.provider.metrics();
        assert_eq!(metrics.writer_releases, 1);
        assert_eq!(metrics.active_connections, 0);

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if event == TransportEvent::Closed {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);

        // No restart after an explicit close.
        channel.fail(TransportError::ConnectionLost("late".into()));
        settle().await;
        assert_eq!(f.factory.count(), 1);
        assert!(matches!(
            f.provider.attach_handler(pong()).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_protocol_versions() {
        let f = fixture(true);
        assert_eq!(f.provider.protocol_versions(), &["2024-11-05"]);
    }

    #[tokio::test]
    async fn test_bind_removes_stale_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"left over").unwrap();

        let config = UnixConfig {
            socket_path: path.clone(),
            ..UnixConfig::default()
        };
        let provider = UnixServerTransportProvider::bind(config).await.unwrap();
        assert!(!path.exists());
        assert_eq!(provider.socket_path(), path.as_path());
    }
}
