//! The two message queues of a session generation.

mod inbound;
mod outbound;

pub use inbound::InboundPipe;
pub use outbound::{DeliveryReceipt, OutboundPipe};
pub(crate) use outbound::Writer;
