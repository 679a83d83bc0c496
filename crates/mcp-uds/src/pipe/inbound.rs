//! Inbound pipe: lines from the channel become queued messages for the dispatch loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mcp_uds_protocol::{CodecError, JsonRpcMessage, LineCodec};
use mcp_uds_transport_traits::{AtomicMetrics, TransportError, TransportResult};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Single-producer queue of received messages for one generation.
#[derive(Debug)]
pub struct InboundPipe {
    tx: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    completed: AtomicBool,
    codec: LineCodec,
    metrics: Arc<AtomicMetrics>,
}

impl InboundPipe {
    /// An open, empty pipe decoding with `codec`.
    pub fn new(codec: LineCodec, metrics: Arc<AtomicMetrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            completed: AtomicBool::new(false),
            codec,
            metrics,
        }
    }

    /// Decode one raw line and queue it for dispatch.
    ///
    /// Blank lines are skipped. A line that does not decode, or that cannot be
    /// queued while the pipe is still open, is an error the caller must treat as
    /// fatal to the session. Lines arriving after completion are dropped.
    pub fn deliver(&self, raw_line: &str) -> TransportResult<()> {
        let message = match self.codec.decode(raw_line) {
            Ok(message) => message,
            Err(CodecError::Empty) => {
                trace!("skipping blank line");
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, bytes = raw_line.len(), "rejecting inbound line");
                return Err(err.into());
            }
        };

        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            debug!(method = ?message.method(), "inbound pipe completed, dropping message");
            return Ok(());
        };
        tx.send(message).map_err(|_| {
            TransportError::EnqueueFailed("inbound dispatch loop is gone".into())
        })?;
        self.metrics.record_received(raw_line.len() + 1);
        Ok(())
    }

    /// Hand the queue to the dispatch loop. Only the first call gets it.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.rx.lock().take()
    }

    /// Stop accepting lines. The dispatch loop ends once it sees this.
    ///
    /// Returns `true` on the first call.
    pub fn complete(&self) -> bool {
        let was_open = self.tx.lock().take().is_some();
        if was_open {
            self.completed.store(true, Ordering::Release);
        }
        was_open
    }

    /// `true` once [`InboundPipe::complete`] has run.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}
