//! One connection generation: channel, pipes, gate, closing flag and writer.
//!
//! A generation is created before its peer exists. The dispatch loop starts
//! immediately; the writer starts when the channel reports a peer. Teardown runs
//! the closing sequence exactly once:
//!
//! 1. set the closing flag
//! 2. complete the inbound pipe (the dispatch loop then completes the outbound pipe)
//! 3. give an in-flight write the grace period to finish
//! 4. close the line channel
//! 5. release the writer task

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use mcp_uds_protocol::{JsonRpcMessage, LineCodec};
use mcp_uds_transport_traits::{
    AtomicMetrics, ChannelEvents, LineChannel, MessageHandler, SessionState, TransportError,
    TransportEventEmitter, TransportResult,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::closing::ClosingFlag;
use crate::gate::ReadinessGate;
use crate::pipe::{InboundPipe, OutboundPipe, Writer};

/// Monotonically increasing identifier of a connection generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(u64);

impl GenerationId {
    /// The first generation of a transport.
    pub const FIRST: Self = Self(1);

    /// The generation after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Raw sequence number.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Called when a generation hits an error that ends it.
///
/// Runs on the channel or writer task, so implementations must not block.
pub(crate) type FatalHook = Arc<dyn Fn(GenerationId, TransportError) + Send + Sync>;

/// Everything a generation needs besides its channel.
#[derive(Clone)]
pub(crate) struct GenerationContext {
    pub(crate) codec: LineCodec,
    pub(crate) grace_period: Duration,
    pub(crate) metrics: Arc<AtomicMetrics>,
    pub(crate) events: TransportEventEmitter,
    pub(crate) on_fatal: FatalHook,
    /// Set once any generation built from this context attaches a peer.
    pub(crate) ever_attached: Arc<AtomicBool>,
}

pub(crate) struct Generation {
    id: GenerationId,
    channel: Arc<dyn LineChannel>,
    outbound: Arc<OutboundPipe>,
    inbound: InboundPipe,
    gate: ReadinessGate,
    closing: Arc<ClosingFlag>,
    state: Mutex<SessionState>,
    writer: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
    ctx: GenerationContext,
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .field("closing", &self.closing.get())
            .field("pending_outbound", &self.pending_outbound())
            .finish_non_exhaustive()
    }
}

impl Generation {
    pub(crate) fn new(
        id: GenerationId,
        channel: Arc<dyn LineChannel>,
        ctx: GenerationContext,
    ) -> Arc<Self> {
        ctx.metrics.generations.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            channel,
            outbound: Arc::new(OutboundPipe::new(Arc::clone(&ctx.metrics))),
            inbound: InboundPipe::new(ctx.codec, Arc::clone(&ctx.metrics)),
            gate: ReadinessGate::new(),
            closing: Arc::new(ClosingFlag::new()),
            state: Mutex::new(SessionState::Initializing),
            writer: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            ctx,
        })
    }

    pub(crate) fn id(&self) -> GenerationId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Peer attached and not closing, as one atomic read.
    pub(crate) fn is_live(&self) -> bool {
        self.closing.is_live()
    }

    pub(crate) fn pending_outbound(&self) -> usize {
        self.outbound.pending()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn channel_events(self: &Arc<Self>) -> Arc<dyn ChannelEvents> {
        Arc::new(GenerationEvents {
            generation: Arc::downgrade(self),
        })
    }

    /// Bind and wait for a peer in the background.
    pub(crate) async fn listen(self: &Arc<Self>) -> TransportResult<()> {
        self.channel.start(self.channel_events()).await
    }

    /// Connect to a listening peer.
    pub(crate) async fn connect(self: &Arc<Self>) -> TransportResult<()> {
        self.channel.connect(self.channel_events()).await
    }

    /// Start the dispatch loop feeding `handler`. Only the first call has an effect.
    ///
    /// `handle` is called once per message in receipt order. Calls that suspend
    /// keep running concurrently with the messages behind them.
    pub(crate) fn spawn_dispatch(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) {
        let Some(mut rx) = self.inbound.take_receiver() else {
            warn!(generation = %self.id, "dispatch loop already running");
            return;
        };

        let generation = Arc::clone(self);
        tokio::spawn(async move {
            generation.gate.mark_inbound_started();
            let mut in_flight = FuturesUnordered::new();
            loop {
                tokio::select! {
                    received = rx.recv() => {
                        let Some(message) = received else { break };
                        if generation.inbound.is_completed() {
                            debug!(generation = %generation.id, method = ?message.method(), "discarding message received before completion");
                            continue;
                        }
                        // Entered here, in receipt order. The rest runs alongside later messages.
                        let mut handling = Box::pin(generation.dispatch(handler.as_ref(), message));
                        if futures::poll!(handling.as_mut()).is_pending() {
                            in_flight.push(handling);
                        }
                    }
                    Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                }
            }
            generation.outbound.complete();
            while in_flight.next().await.is_some() {}
            debug!(generation = %generation.id, "dispatch loop finished");
        });
    }

    async fn dispatch(&self, handler: &dyn MessageHandler, message: JsonRpcMessage) {
        let method = message.method().map(str::to_owned);
        match handler.handle(message).await {
            Ok(Some(reply)) => {
                if let Err(err) = self.send_message(reply).await {
                    debug!(generation = %self.id, ?method, error = %err, "reply not delivered");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(generation = %self.id, ?method, error = %err, "session logic failed to handle message");
            }
        }
    }

    /// Queue `message`, wait for the gate, then wait for the write.
    pub(crate) async fn send_message(&self, message: JsonRpcMessage) -> TransportResult<()> {
        let receipt = self.outbound.enqueue(message)?;
        self.gate.wait_ready().await?;
        receipt.delivered().await
    }

    fn peer_attached(self: &Arc<Self>) {
        if !self.closing.mark_peer_attached() {
            debug!(generation = %self.id, "peer attached after closing started");
            return;
        }
        self.ctx.ever_attached.store(true, Ordering::Release);
        self.ctx.metrics.record_connected();
        self.ctx.events.emit_peer_connected(self.id.get());
        self.spawn_writer();
        self.set_state(SessionState::Ready);
        info!(generation = %self.id, "peer attached");
    }

    fn spawn_writer(self: &Arc<Self>) {
        let mut slot = self.writer.lock();
        if slot.is_some() || self.closing.is_closing() {
            return;
        }
        let Some(rx) = self.outbound.take_receiver() else {
            return;
        };

        let writer = Writer {
            rx,
            pipe: Arc::clone(&self.outbound),
            channel: Arc::clone(&self.channel),
            closing: Arc::clone(&self.closing),
            codec: self.ctx.codec,
            metrics: Arc::clone(&self.ctx.metrics),
            generation: self.id.get(),
        };
        let generation = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            generation.gate.mark_outbound_attached();
            if let Err(err) = writer.run().await {
                (generation.ctx.on_fatal)(generation.id, err);
            }
        }));
    }

    fn channel_failed(&self, error: TransportError) {
        if self.closing.is_closing() {
            debug!(generation = %self.id, error = %error, "channel error while closing");
            return;
        }
        if matches!(error, TransportError::ConnectionLost(_)) {
            info!(generation = %self.id, error = %error, "peer disconnected");
        } else {
            error!(generation = %self.id, error = %error, "fatal session error");
        }
        (self.ctx.on_fatal)(self.id, error);
    }

    /// Run the closing sequence. Returns `false` if it already ran.
    pub(crate) async fn close(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        let was_live = self.closing.is_live();
        self.set_state(SessionState::Closing);

        self.closing.begin_closing();
        self.gate.abandon();
        self.inbound.complete();

        let writer = self.writer.lock().take();
        match writer {
            Some(mut handle) => {
                if tokio::time::timeout(self.ctx.grace_period, &mut handle)
                    .await
                    .is_err()
                {
                    debug!(generation = %self.id, "writer still busy after grace period");
                }
                self.channel.close().await;
                self.outbound.complete();
                handle.abort();
                self.ctx
                    .metrics
                    .writer_releases
                    .fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.channel.close().await;
                self.outbound.complete();
            }
        }

        self.closing.mark_closed();
        if was_live {
            self.ctx.metrics.record_disconnected();
            self.ctx.events.emit_peer_disconnected(self.id.get(), None);
        }
        self.set_state(SessionState::Closed);
        debug!(generation = %self.id, "generation closed");
        true
    }
}

/// Channel callbacks routed to a generation that may already be gone.
struct GenerationEvents {
    generation: Weak<Generation>,
}

impl ChannelEvents for GenerationEvents {
    fn on_connected(&self) {
        if let Some(generation) = self.generation.upgrade() {
            generation.peer_attached();
        }
    }

    fn on_line(&self, line: String) -> TransportResult<()> {
        match self.generation.upgrade() {
            Some(generation) => generation.inbound.deliver(&line),
            None => Ok(()),
        }
    }

    fn on_error(&self, error: TransportError) {
        if let Some(generation) = self.generation.upgrade() {
            generation.channel_failed(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedChannel, settle, wait_until, within};
    use mcp_uds_transport_traits::FnHandler;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        generation: Arc<Generation>,
        channel: Arc<ScriptedChannel>,
        metrics: Arc<AtomicMetrics>,
        fatal_rx: mpsc::UnboundedReceiver<(GenerationId, TransportError)>,
    }

    fn harness_with(channel: Arc<ScriptedChannel>) -> Harness {
        let metrics = Arc::new(AtomicMetrics::new());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let ctx = GenerationContext {
            codec: LineCodec::default(),
            grace_period: Duration::from_millis(50),
            metrics: Arc::clone(&metrics),
            events: TransportEventEmitter::new().0,
            on_fatal: Arc::new(move |id, err| {
                let _ = fatal_tx.send((id, err));
            }),
            ever_attached: Arc::new(AtomicBool::new(false)),
        };
        let generation = Generation::new(GenerationId::FIRST, Arc::clone(&channel) as Arc<dyn LineChannel>, ctx);
        Harness {
            generation,
            channel,
            metrics,
            fatal_rx,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedChannel::new())
    }

    fn pong_handler() -> Arc<dyn MessageHandler> {
        Arc::new(FnHandler::new(|msg: JsonRpcMessage| async move {
            let reply = match (msg.method(), msg.id()) {
                (Some("ping"), Some(id)) => Some(JsonRpcMessage::success(json!("pong"), id.clone())),
                _ => None,
            };
            Ok::<_, TransportError>(reply)
        }))
    }

    #[tokio::test]
    async fn test_no_write_before_peer_is_accepted() {
        let h = harness();
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();

        let sender = {
            let generation = Arc::clone(&h.generation);
            tokio::spawn(async move {
                generation
                    .send_message(JsonRpcMessage::notification("early", None))
                    .await
            })
        };
        settle().await;
        assert!(h.channel.writes().is_empty());
        assert!(!sender.is_finished());
        assert_eq!(h.generation.pending_outbound(), 1);
        assert_eq!(h.generation.state(), SessionState::Initializing);

        h.channel.accept();
        within(sender).await.unwrap().unwrap();
        assert_eq!(h.channel.writes().len(), 1);
        assert!(h.channel.writes()[0].contains("\"early\""));
        assert_eq!(h.generation.state(), SessionState::Ready);
        assert!(h.generation.is_live());
    }

    #[tokio::test]
    async fn test_reply_goes_back_on_same_generation() {
        let h = harness();
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();
        h.channel.accept();

        h.channel.push_line(r#"{"id":1,"method":"ping"}"#);
        let channel = Arc::clone(&h.channel);
        wait_until(move || !channel.writes().is_empty()).await;

        let reply: serde_json::Value = serde_json::from_str(&h.channel.writes()[0]).unwrap();
        assert_eq!(reply, json!({"jsonrpc": "2.0", "result": "pong", "id": 1}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handler_sees_messages_in_receipt_order() {
        const COUNT: u64 = 2000;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            FnHandler::new(move |msg: JsonRpcMessage| {
                let n = msg
                    .params()
                    .and_then(|params| params["n"].as_u64())
                    .unwrap_or(u64::MAX);
                seen.lock().push(n);
                async move {
                    tokio::task::yield_now().await;
                    Ok::<_, TransportError>(None)
                }
            })
        };

        let h = harness();
        h.generation.spawn_dispatch(Arc::new(handler));
        h.generation.listen().await.unwrap();
        h.channel.accept();
        for n in 0..COUNT {
            h.channel
                .push_line(&json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": n}}).to_string());
        }

        let recorded = Arc::clone(&seen);
        wait_until(move || recorded.lock().len() == COUNT as usize).await;
        let expected: Vec<u64> = (0..COUNT).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_suspended_handler_does_not_hold_back_later_messages() {
        let release = Arc::new(tokio::sync::Notify::new());
        let handler = {
            let release = Arc::clone(&release);
            FnHandler::new(move |msg: JsonRpcMessage| {
                let release = Arc::clone(&release);
                async move {
                    if msg.method() == Some("slow") {
                        release.notified().await;
                    }
                    Ok::<_, TransportError>(
                        msg.id()
                            .cloned()
                            .map(|id| JsonRpcMessage::success(json!(msg.method()), id)),
                    )
                }
            })
        };

        let h = harness();
        h.generation.spawn_dispatch(Arc::new(handler));
        h.generation.listen().await.unwrap();
        h.channel.accept();

        h.channel.push_line(r#"{"id":1,"method":"slow"}"#);
        h.channel.push_line(r#"{"id":2,"method":"ping"}"#);
        let channel = Arc::clone(&h.channel);
        wait_until(move || channel.writes().len() == 1).await;
        assert!(h.channel.writes()[0].contains("\"id\":2"));

        release.notify_one();
        let channel = Arc::clone(&h.channel);
        wait_until(move || channel.writes().len() == 2).await;
        assert!(h.channel.writes()[1].contains("\"id\":1"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let h = harness();
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();
        h.channel.accept();
        within(
            h.generation
                .send_message(JsonRpcMessage::notification("hello", None)),
        )
        .await
        .unwrap();

        assert!(within(h.generation.close()).await);
        assert!(!within(h.generation.close()).await);

        assert_eq!(h.generation.state(), SessionState::Closed);
        assert!(!h.generation.is_live());
        assert_eq!(h.channel.close_calls(), 1);
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.writer_releases, 1);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[tokio::test]
    async fn test_inbound_completion_fails_queued_outbound() {
        let (channel, permits) = ScriptedChannel::with_blocked_writes();
        let h = harness_with(channel);
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();
        h.channel.accept();

        let mut senders = Vec::new();
        for n in 0..3 {
            let generation = Arc::clone(&h.generation);
            senders.push(tokio::spawn(async move {
                generation
                    .send_message(JsonRpcMessage::notification("queued", Some(json!({ "n": n }))))
                    .await
            }));
            settle().await;
        }
        // The first message is in flight, two are queued behind it.
        assert_eq!(h.generation.pending_outbound(), 3);

        h.generation.inbound.complete();
        let outbound = Arc::clone(&h.generation.outbound);
        wait_until(move || outbound.is_completed()).await;
        permits.add_permits(3);

        let mut results = Vec::new();
        for sender in senders {
            results.push(within(sender).await.unwrap());
        }
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(TransportError::EnqueueFailed(_))));
        assert!(matches!(results[2], Err(TransportError::EnqueueFailed(_))));
        assert_eq!(h.channel.writes().len(), 1);
        assert_eq!(h.metrics.snapshot().failed_deliveries, 2);
    }

    #[tokio::test]
    async fn test_bad_line_reports_fatal_error() {
        let mut h = harness();
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();
        h.channel.accept();

        h.channel.push_line("this is not json");
        let (id, err) = within(h.fatal_rx.recv()).await.unwrap();
        assert_eq!(id, GenerationId::FIRST);
        assert!(matches!(err, TransportError::SerializationFailed(_)));
    }

    #[tokio::test]
    async fn test_write_failure_reports_fatal_error() {
        let mut h = harness();
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();
        h.channel.accept();
        h.channel.set_fail_writes(true);

        let result = within(
            h.generation
                .send_message(JsonRpcMessage::notification("doomed", None)),
        )
        .await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        let (_, err) = within(h.fatal_rx.recv()).await.unwrap();
        assert!(matches!(err, TransportError::SendFailed(_)));
        assert!(!h.generation.is_live());
    }

    #[tokio::test]
    async fn test_errors_while_closing_are_not_escalated() {
        let mut h = harness();
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();
        h.channel.accept();

        within(h.generation.close()).await;
        h.channel.fail(TransportError::ConnectionLost("late".into()));
        settle().await;
        assert!(h.fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let h = harness();
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();
        within(h.generation.close()).await;

        let result = h
            .generation
            .send_message(JsonRpcMessage::notification("late", None))
            .await;
        assert!(matches!(result, Err(TransportError::EnqueueFailed(_))));
        assert_eq!(h.metrics.snapshot().writer_releases, 0);
    }

    #[tokio::test]
    async fn test_close_before_accept_releases_waiting_senders() {
        let h = harness();
        h.generation.spawn_dispatch(pong_handler());
        h.generation.listen().await.unwrap();

        let sender = {
            let generation = Arc::clone(&h.generation);
            tokio::spawn(async move {
                generation
                    .send_message(JsonRpcMessage::notification("never", None))
                    .await
            })
        };
        settle().await;
        within(h.generation.close()).await;

        assert!(within(sender).await.unwrap().is_err());
        assert!(h.channel.writes().is_empty());
        assert_eq!(h.generation.pending_outbound(), 0);
        assert_eq!(h.metrics.snapshot().failed_deliveries, 1);

        // A late accept does not revive the generation.
        h.channel.accept();
        assert!(!h.generation.is_live());
    }
}
