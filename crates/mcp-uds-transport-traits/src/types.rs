//! Core transport types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session transport.
///
/// ```text
/// Initializing -> Ready -> Closing -> Closed
///       ^                     |
///       +---- Restarting <----+   (server only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Pipes and gate exist; waiting for a peer.
    Initializing,
    /// A peer is attached and traffic flows both ways.
    Ready,
    /// The current generation is being torn down.
    Closing,
    /// Terminal. No further generations will be created.
    Closed,
    /// A fatal error retired the previous generation and a new one is being set up.
    Restarting,
}

impl SessionState {
    /// Returns `true` once nothing more can happen on this session.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Restarting => write!(f, "restarting"),
        }
    }
}

/// Value of the per-generation closing flag.
///
/// Ordered: a flag only ever moves forward through these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ClosingState {
    /// Normal operation.
    Open = 0,
    /// Shutdown in progress; write errors are expected.
    Closing = 1,
    /// Shutdown finished.
    Closed = 2,
}

impl ClosingState {
    /// Decode the raw value stored in an atomic. Unknown values map to `Closed`.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ClosingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
