//! Readiness gate: two one-shot latches that must both fire before a send completes.

use mcp_uds_transport_traits::{TransportError, TransportResult};
use tokio::sync::watch;

/// A one-shot latch. Fires at most once; waiters wake when it does.
#[derive(Debug)]
struct Latch {
    tx: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }
}

impl Latch {
    /// Returns `true` the first time only.
    fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Gate for one connection generation.
///
/// Opens when the dispatch loop has started consuming inbound messages and the
/// writer has attached to the outbound queue. A fresh gate is created for every
/// generation.
///
/// ```rust
/// use mcp_uds::ReadinessGate;
///
/// # tokio_test::block_on(async {
/// let gate = ReadinessGate::new();
/// gate.mark_inbound_started();
/// assert!(!gate.is_ready());
/// gate.mark_outbound_attached();
/// assert!(gate.wait_ready().await.is_ok());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct ReadinessGate {
    inbound_started: Latch,
    outbound_attached: Latch,
    abandoned: Latch,
}

impl ReadinessGate {
    /// A closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// The dispatch loop began consuming. Returns `true` the first time.
    pub fn mark_inbound_started(&self) -> bool {
        self.inbound_started.fire()
    }

    /// The writer attached to the outbound queue. Returns `true` the first time.
    pub fn mark_outbound_attached(&self) -> bool {
        self.outbound_attached.fire()
    }

    /// The generation is shutting down; waiters that are not yet ready give up.
    pub fn abandon(&self) {
        self.abandoned.fire();
    }

    /// Both latches have fired.
    pub fn is_ready(&self) -> bool {
        self.inbound_started.is_fired() && self.outbound_attached.is_fired()
    }

    /// Wait for both latches.
    ///
    /// Fails with [`TransportError::Closed`] if the generation is abandoned
    /// before the gate opens.
    pub async fn wait_ready(&self) -> TransportResult<()> {
        tokio::select! {
            biased;
            () = async {
                self.inbound_started.wait().await;
                self.outbound_attached.wait().await;
            } => Ok(()),
            () = self.abandoned.wait() => Err(TransportError::Closed),
        }
    }
}
