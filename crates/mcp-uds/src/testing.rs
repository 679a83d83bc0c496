//! In-memory line channel driven by the test, recording every write.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mcp_uds_transport_traits::{ChannelEvents, LineChannel, TransportError, TransportResult};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::channel::ChannelFactory;
use crate::config::UnixConfig;

/// A [`LineChannel`] whose accepts, lines and failures are scripted by the test.
#[derive(Default)]
pub(crate) struct ScriptedChannel {
    events: Mutex<Option<Arc<dyn ChannelEvents>>>,
    writes: Mutex<Vec<String>>,
    connected: AtomicBool,
    started: AtomicBool,
    close_calls: AtomicUsize,
    fail_writes: AtomicBool,
    fail_bind: AtomicBool,
    /// When set, each write waits for one permit.
    write_permits: Option<Arc<Semaphore>>,
}

impl fmt::Debug for ScriptedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedChannel")
            .field("writes", &self.writes.lock().len())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ScriptedChannel {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writes block until the returned semaphore hands out permits.
    pub(crate) fn with_blocked_writes() -> (Arc<Self>, Arc<Semaphore>) {
        let permits = Arc::new(Semaphore::new(0));
        let channel = Arc::new(Self {
            write_permits: Some(Arc::clone(&permits)),
            ..Self::default()
        });
        (channel, permits)
    }

    pub(crate) fn failing_bind() -> Arc<Self> {
        let channel = Self::default();
        channel.fail_bind.store(true, Ordering::SeqCst);
        Arc::new(channel)
    }

    fn events(&self) -> Arc<dyn ChannelEvents> {
        self.events
            .lock()
            .clone()
            .expect("channel was never started")
    }

    /// Simulate a peer being accepted.
    pub(crate) fn accept(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.events().on_connected();
    }

    /// Simulate one line arriving; a rejected line fails the channel like a real one.
    pub(crate) fn push_line(&self, line: &str) {
        let events = self.events();
        if let Err(err) = events.on_line(line.to_string()) {
            self.connected.store(false, Ordering::SeqCst);
            events.on_error(err);
        }
    }

    /// Simulate a fatal read error or disconnect.
    pub(crate) fn fail(&self, error: TransportError) {
        self.connected.store(false, Ordering::SeqCst);
        self.events().on_error(error);
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LineChannel for ScriptedChannel {
    async fn start(&self, events: Arc<dyn ChannelEvents>) -> TransportResult<()> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(TransportError::BindFailed("scripted bind failure".into()));
        }
        *self.events.lock() = Some(events);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, events: Arc<dyn ChannelEvents>) -> TransportResult<()> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("scripted connect failure".into()));
        }
        *self.events.lock() = Some(Arc::clone(&events));
        self.started.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        events.on_connected();
        Ok(())
    }

    async fn write_message(&self, line: &str) -> TransportResult<()> {
        if let Some(permits) = &self.write_permits {
            permits
                .acquire()
                .await
                .map_err(|_| TransportError::SendFailed("permits closed".into()))?
                .forget();
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("scripted write failure".into()));
        }
        self.writes.lock().push(line.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out a new [`ScriptedChannel`] per generation and remembers each one.
#[derive(Debug, Default)]
pub(crate) struct ScriptedFactory {
    channels: Mutex<Vec<Arc<ScriptedChannel>>>,
    fail_after: Option<usize>,
}

impl ScriptedFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Channels after the first `n` fail to bind.
    pub(crate) fn failing_after(n: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_after: Some(n),
            ..Self::default()
        })
    }

    pub(crate) fn factory(self: &Arc<Self>) -> ChannelFactory {
        let this = Arc::clone(self);
        Arc::new(move |_config: &UnixConfig| -> Arc<dyn LineChannel> {
            let mut channels = this.channels.lock();
            let channel = match this.fail_after {
                Some(n) if channels.len() >= n => ScriptedChannel::failing_bind(),
                _ => ScriptedChannel::new(),
            };
            channels.push(Arc::clone(&channel));
            channel as Arc<dyn LineChannel>
        })
    }

    pub(crate) fn count(&self) -> usize {
        self.channels.lock().len()
    }

    pub(crate) fn channel(&self, index: usize) -> Arc<ScriptedChannel> {
        Arc::clone(&self.channels.lock()[index])
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached in time");
}

/// Let spawned tasks make progress without advancing any specific condition.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Await `future`, panicking after two seconds.
pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("future did not complete in time")
}
