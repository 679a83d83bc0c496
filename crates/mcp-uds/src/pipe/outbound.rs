//! Outbound pipe: an unbounded FIFO drained by exactly one writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use mcp_uds_protocol::{JsonRpcMessage, LineCodec};
use mcp_uds_transport_traits::{AtomicMetrics, LineChannel, TransportError, TransportResult};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::closing::ClosingFlag;

#[derive(Debug)]
struct Counters {
    pending: AtomicUsize,
    metrics: Arc<AtomicMetrics>,
}

/// A queued message together with its delivery receipt.
///
/// Dropping an entry that was never resolved fails its receipt, so a message
/// can be written or failed but never lost without a trace.
#[derive(Debug)]
pub(crate) struct Outbound {
    message: JsonRpcMessage,
    receipt: Option<oneshot::Sender<TransportResult<()>>>,
    counters: Arc<Counters>,
}

impl Outbound {
    pub(crate) fn message(&self) -> &JsonRpcMessage {
        &self.message
    }

    pub(crate) fn delivered(mut self) {
        self.resolve(Ok(()));
    }

    pub(crate) fn failed(mut self, error: TransportError) {
        self.resolve(Err(error));
    }

    fn resolve(&mut self, result: TransportResult<()>) {
        let Some(receipt) = self.receipt.take() else {
            return;
        };
        self.counters.pending.fetch_sub(1, Ordering::AcqRel);
        if result.is_err() {
            self.counters
                .metrics
                .failed_deliveries
                .fetch_add(1, Ordering::Relaxed);
        }
        // The sender may have stopped waiting.
        let _ = receipt.send(result);
    }

    /// Forget the receipt without counting a failure.
    fn disarm(mut self) {
        if self.receipt.take().is_some() {
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.resolve(Err(completed_error()));
    }
}

fn completed_error() -> TransportError {
    TransportError::EnqueueFailed("outbound pipe completed before the message was written".into())
}

/// Resolves once the writer has written or failed the message.
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<TransportResult<()>>,
}

impl DeliveryReceipt {
    /// Wait for the outcome of the write.
    pub async fn delivered(self) -> TransportResult<()> {
        self.rx.await.unwrap_or_else(|_| Err(completed_error()))
    }
}

/// Multi-producer queue of outgoing messages for one generation.
#[derive(Debug)]
pub struct OutboundPipe {
    tx: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    completed: AtomicBool,
    counters: Arc<Counters>,
}

impl OutboundPipe {
    /// An open, empty pipe.
    pub fn new(metrics: Arc<AtomicMetrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            completed: AtomicBool::new(false),
            counters: Arc::new(Counters {
                pending: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    /// Queue `message` behind everything already enqueued.
    ///
    /// Fails with [`TransportError::EnqueueFailed`] once the pipe is completed.
    pub fn enqueue(&self, message: JsonRpcMessage) -> TransportResult<DeliveryReceipt> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::EnqueueFailed(
                "outbound pipe is completed".into(),
            ));
        };

        let (receipt_tx, receipt_rx) = oneshot::channel();
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        let entry = Outbound {
            message,
            receipt: Some(receipt_tx),
            counters: Arc::clone(&self.counters),
        };

        match tx.send(entry) {
            Ok(()) => Ok(DeliveryReceipt { rx: receipt_rx }),
            Err(mpsc::error::SendError(entry)) => {
                entry.disarm();
                Err(TransportError::EnqueueFailed(
                    "outbound writer is gone".into(),
                ))
            }
        }
    }

    /// Hand the queue to the writer. Only the first call gets it.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Outbound>> {
        self.rx.lock().take()
    }

    /// Stop accepting messages. Returns `true` on the first call.
    ///
    /// Entries still queued are failed: immediately if no writer ever attached,
    /// otherwise by the writer as it drains the queue.
    pub fn complete(&self) -> bool {
        let tx = self.tx.lock().take();
        if tx.is_none() {
            return false;
        }
        self.completed.store(true, Ordering::Release);
        drop(tx);

        if let Some(mut rx) = self.take_receiver() {
            rx.close();
            while let Ok(entry) = rx.try_recv() {
                entry.failed(completed_error());
            }
        }
        true
    }

    /// `true` once [`OutboundPipe::complete`] has run.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Messages queued but neither written nor failed yet.
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }
}

/// The single consumer of an [`OutboundPipe`].
#[derive(Debug)]
pub(crate) struct Writer {
    pub(crate) rx: mpsc::UnboundedReceiver<Outbound>,
    pub(crate) pipe: Arc<OutboundPipe>,
    pub(crate) channel: Arc<dyn LineChannel>,
    pub(crate) closing: Arc<ClosingFlag>,
    pub(crate) codec: LineCodec,
    pub(crate) metrics: Arc<AtomicMetrics>,
    pub(crate) generation: u64,
}

impl Writer {
    /// Write queued messages one at a time, in order, until the pipe completes.
    ///
    /// Returns the error that ended the session if a message could not be
    /// encoded or written while the generation was still open.
    pub(crate) async fn run(mut self) -> TransportResult<()> {
        let generation = self.generation;
        let mut fatal = None;

        while let Some(entry) = self.rx.recv().await {
            if fatal.is_some() || self.pipe.is_completed() {
                entry.failed(completed_error());
                continue;
            }

            match self.write(entry.message()).await {
                Ok(()) => entry.delivered(),
                Err(err) if self.closing.is_closing() => {
                    debug!(generation, error = %err, "write failed while closing");
                    entry.failed(err);
                }
                Err(err) => {
                    error!(generation, error = %err, "outbound write failed");
                    self.pipe.complete();
                    self.closing.begin_closing();
                    entry.failed(err.clone());
                    fatal = Some(err);
                }
            }
        }

        self.closing.begin_closing();
        debug!(generation, "outbound writer finished");
        fatal.map_or(Ok(()), Err)
    }

    async fn write(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        let line = self.codec.encode(message)?;
        let started = Instant::now();
        self.channel.write_message(&line).await?;
        self.metrics
            .update_latency_us(started.elapsed().as_micros() as u64);
        self.metrics.record_sent(line.len() + 1);
        trace!(generation = self.generation, bytes = line.len(), "line written");
        Ok(())
    }
}
