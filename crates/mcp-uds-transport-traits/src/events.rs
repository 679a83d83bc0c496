//! Transport lifecycle events.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::TransportError;

/// Capacity of the event channel. Events beyond this are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 500;

/// Lifecycle notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportEvent {
    /// The server is bound and waiting for a peer.
    Listening {
        /// Socket path being listened on.
        path: PathBuf,
        /// Generation that owns the listener.
        generation: u64,
    },

    /// A peer was accepted (server) or the connect succeeded (client).
    PeerConnected {
        /// Generation the peer belongs to.
        generation: u64,
    },

    /// The peer of a generation went away.
    PeerDisconnected {
        /// Generation the peer belonged to.
        generation: u64,
        /// Why the connection ended, if known.
        reason: Option<String>,
    },

    /// A new generation replaced a failed one.
    Restarted {
        /// Generation that was retired.
        previous: u64,
        /// Generation now waiting for a peer.
        generation: u64,
    },

    /// The transport is permanently closed.
    Closed,

    /// An error occurred.
    Error {
        /// The error that occurred.
        error: TransportError,
        /// Optional additional context about the error.
        context: Option<String>,
    },
}

/// An emitter for broadcasting `TransportEvent`s to a listener.
#[derive(Debug, Clone)]
pub struct TransportEventEmitter {
    sender: mpsc::Sender<TransportEvent>,
}

impl TransportEventEmitter {
    /// Creates a new event emitter and a corresponding receiver.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<TransportEvent>) {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }

    /// Emits an event, dropping it if the channel is full or the receiver is gone.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.sender.try_send(event);
    }

    /// Emits a `Listening` event.
    pub fn emit_listening(&self, path: PathBuf, generation: u64) {
        self.emit(TransportEvent::Listening { path, generation });
    }

    /// Emits a `PeerConnected` event.
    pub fn emit_peer_connected(&self, generation: u64) {
        self.emit(TransportEvent::PeerConnected { generation });
    }

    /// Emits a `PeerDisconnected` event.
    pub fn emit_peer_disconnected(&self, generation: u64, reason: Option<String>) {
        self.emit(TransportEvent::PeerDisconnected { generation, reason });
    }

    /// Emits a `Restarted` event.
    pub fn emit_restarted(&self, previous: u64, generation: u64) {
        self.emit(TransportEvent::Restarted {
            previous,
            generation,
        });
    }

    /// Emits a `Closed` event.
    pub fn emit_closed(&self) {
        self.emit(TransportEvent::Closed);
    }

    /// Emits an `Error` event.
    pub fn emit_error(&self, error: TransportError, context: Option<String>) {
        self.emit(TransportEvent::Error { error, context });
    }
}
