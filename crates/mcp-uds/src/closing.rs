//! Per-generation closing flag.

use std::sync::atomic::{AtomicU8, Ordering};

use mcp_uds_transport_traits::ClosingState;

/// Set while a peer is attached and the flag is still `Open`.
const PEER_BIT: u8 = 0b100;
const STATE_MASK: u8 = 0b011;

/// Tri-state closing flag with a peer-attached bit packed into the same atomic.
///
/// The state only moves forward (`Open -> Closing -> Closed`). Leaving `Open`
/// clears the peer bit in the same operation, so [`ClosingFlag::is_live`] is a
/// single load that can never observe a closing generation as connected.
#[derive(Debug, Default)]
pub struct ClosingFlag {
    bits: AtomicU8,
}

impl ClosingFlag {
    /// A fresh flag in the `Open` state with no peer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn get(&self) -> ClosingState {
        ClosingState::from_u8(self.bits.load(Ordering::Acquire) & STATE_MASK)
    }

    /// `true` once the flag has left `Open`.
    pub fn is_closing(&self) -> bool {
        self.get() != ClosingState::Open
    }

    /// `true` while a peer is attached and nobody has started closing.
    pub fn is_live(&self) -> bool {
        self.bits.load(Ordering::Acquire) == PEER_BIT
    }

    /// Record that a peer is attached. Ignored once closing has started.
    ///
    /// Returns `true` if the bit was set by this call.
    pub fn mark_peer_attached(&self) -> bool {
        self.bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (bits == 0).then_some(PEER_BIT)
            })
            .is_ok()
    }

    /// Move to `Closing`. Returns `true` if this call left `Open`.
    pub fn begin_closing(&self) -> bool {
        self.advance(ClosingState::Closing) == ClosingState::Open
    }

    /// Move to `Closed`.
    pub fn mark_closed(&self) {
        self.advance(ClosingState::Closed);
    }

    /// Move forward to `to` (never backward) and return the previous state.
    fn advance(&self, to: ClosingState) -> ClosingState {
        let previous = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let state = bits & STATE_MASK;
                let next = state.max(to as u8);
                // Any state other than Open drops the peer bit.
                Some(if next == 0 { bits } else { next })
            })
            .unwrap_or_else(|bits| bits);
        ClosingState::from_u8(previous & STATE_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_open_without_peer() {
        let flag = ClosingFlag::new();
        assert_eq!(flag.get(), ClosingState::Open);
        assert!(!flag.is_closing());
        assert!(!flag.is_live());
    }

    #[test]
    fn test_peer_bit_and_closing() {
        let flag = ClosingFlag::new();
        assert!(flag.mark_peer_attached());
        assert!(flag.is_live());
        assert!(!flag.mark_peer_attached());

        assert!(flag.begin_closing());
        assert!(!flag.is_live());
        assert_eq!(flag.get(), ClosingState::Closing);
    }

    #[test]
    fn test_never_returns_to_open() {
        let flag = ClosingFlag::new();
        flag.mark_closed();
        assert!(!flag.begin_closing());
        assert_eq!(flag.get(), ClosingState::Closed);
        assert!(!flag.mark_peer_attached());
        assert!(!flag.is_live());
    }

    #[test]
    fn test_begin_closing_reports_first_transition_only() {
        let flag = ClosingFlag::new();
        assert!(flag.begin_closing());
        assert!(!flag.begin_closing());
        flag.mark_closed();
        assert_eq!(flag.get(), ClosingState::Closed);
    }
}
