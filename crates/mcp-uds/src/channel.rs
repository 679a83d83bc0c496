//! Line channel over a Unix domain socket.
//!
//! Framing uses `tokio_util::codec::LinesCodec`: one message per `\n`-terminated
//! line, with the maximum line length enforced while reading. The write half sits
//! behind an async mutex so writes can never interleave.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mcp_uds_transport_traits::{ChannelEvents, LineChannel, TransportError, TransportResult};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, trace, warn};

use crate::config::UnixConfig;

/// Builds a fresh channel for every connection generation.
pub type ChannelFactory = Arc<dyn Fn(&UnixConfig) -> Arc<dyn LineChannel> + Send + Sync>;

/// Factory producing [`UnixLineChannel`]s.
pub fn unix_channel_factory() -> ChannelFactory {
    Arc::new(|config: &UnixConfig| -> Arc<dyn LineChannel> {
        Arc::new(UnixLineChannel::new(config))
    })
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    buffer_size: usize,
    max_line_length: usize,
    /// Write half (tokio mutex - held across the write)
    writer: tokio::sync::Mutex<Option<FramedWrite<OwnedWriteHalf, LinesCodec>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

/// A [`LineChannel`] carrying exactly one peer connection over a Unix socket.
///
/// In server mode the listener accepts a single peer and is dropped right after;
/// a restart creates a new channel and binds again.
#[derive(Debug)]
pub struct UnixLineChannel {
    shared: Arc<Shared>,
    permissions: Option<u32>,
    /// Accept/read task (std mutex - short-lived)
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UnixLineChannel {
    /// Create an idle channel for `config.socket_path`.
    pub fn new(config: &UnixConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: config.socket_path.clone(),
                buffer_size: config.buffer_size,
                max_line_length: config.max_message_size,
                writer: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            permissions: config.permissions,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Socket path this channel binds or connects to.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn store_task(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
        // close() may have run between spawn and store
        if self.shared.closed.load(Ordering::Acquire)
            && let Some(task) = self.task.lock().take()
        {
            task.abort();
        }
    }
}

impl Shared {
    fn codec(&self) -> LinesCodec {
        LinesCodec::new_with_max_length(self.max_line_length)
    }

    /// Install the write half and announce the peer. Returns the framed read half.
    async fn attach(
        &self,
        stream: UnixStream,
        events: &Arc<dyn ChannelEvents>,
    ) -> FramedRead<OwnedReadHalf, LinesCodec> {
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(FramedWrite::new(write_half, self.codec()));
        self.connected.store(true, Ordering::Release);
        events.on_connected();
        FramedRead::with_capacity(read_half, self.codec(), self.buffer_size)
    }

    /// Feed lines to `events` until the stream fails, then report exactly once.
    async fn read_loop(
        self: Arc<Self>,
        mut lines: FramedRead<OwnedReadHalf, LinesCodec>,
        events: Arc<dyn ChannelEvents>,
    ) {
        let error = loop {
            match lines.next().await {
                Some(Ok(line)) => {
                    trace!(path = ?self.path, bytes = line.len(), "line received");
                    if let Err(err) = events.on_line(line) {
                        break err;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(path = ?self.path, max = self.max_line_length, "inbound line too long");
                    break TransportError::SerializationFailed(format!(
                        "line exceeds maximum message size of {} bytes",
                        self.max_line_length
                    ));
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    break TransportError::ConnectionLost(format!("read failed: {e}"));
                }
                None => {
                    break TransportError::ConnectionLost("peer closed the connection".into());
                }
            }
        };

        self.connected.store(false, Ordering::Release);
        if self.closed.load(Ordering::Acquire) {
            debug!(path = ?self.path, error = %error, "read loop ended after close");
        } else {
            debug!(path = ?self.path, error = %error, "read loop ended");
        }
        events.on_error(error);
    }
}

#[async_trait]
impl LineChannel for UnixLineChannel {
    async fn start(&self, events: Arc<dyn ChannelEvents>) -> TransportResult<()> {
        self.ensure_open()?;
        let path = self.shared.path.clone();

        let listener = UnixListener::bind(&path).map_err(|e| {
            TransportError::BindFailed(format!("failed to bind {}: {e}", path.display()))
        })?;

        if let Some(mode) = self.permissions {
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| {
                    TransportError::BindFailed(format!(
                        "failed to set permissions {mode:o} on {}: {e}",
                        path.display()
                    ))
                })?;
        }
        info!(path = ?path, "listening on unix socket");

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    drop(listener);
                    info!(path = ?shared.path, "accepted unix socket peer");
                    let lines = shared.attach(stream, &events).await;
                    shared.read_loop(lines, events).await;
                }
                Err(e) => {
                    events.on_error(TransportError::ConnectionFailed(format!(
                        "accept failed on {}: {e}",
                        shared.path.display()
                    )));
                }
            }
        });
        self.store_task(task);
        Ok(())
    }

    async fn connect(&self, events: Arc<dyn ChannelEvents>) -> TransportResult<()> {
        self.ensure_open()?;
        let stream = UnixStream::connect(&self.shared.path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to connect to {}: {e}",
                self.shared.path.display()
            ))
        })?;
        info!(path = ?self.shared.path, "connected to unix socket");

        let lines = self.shared.attach(stream, &events).await;
        let shared = Arc::clone(&self.shared);
        self.store_task(tokio::spawn(shared.read_loop(lines, events)));
        Ok(())
    }

    async fn write_message(&self, line: &str) -> TransportResult<()> {
        let mut guard = self.shared.writer.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => TransportError::SendFailed(e.to_string()),
            LinesCodecError::MaxLineLengthExceeded => {
                TransportError::SerializationFailed("line too long".into())
            }
        })
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.connected.store(false, Ordering::Release);

        if let Some(task) = self.task.lock().take() {
            task.abort();
        }

        // A write stuck on a full socket keeps the lock; the half is dropped
        // with the channel in that case.
        match self.shared.writer.try_lock() {
            Ok(mut guard) => {
                if let Some(mut sink) = guard.take()
                    && let Err(e) = SinkExt::<&str>::close(&mut sink).await
                {
                    debug!(path = ?self.shared.path, error = %e, "error shutting down write half");
                }
            }
            Err(_) => debug!(path = ?self.shared.path, "write in progress, leaving write half to drop"),
        }
        debug!(path = ?self.shared.path, "line channel closed");
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}
