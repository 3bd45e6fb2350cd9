//! Topic-based publish/subscribe bus used to carry session-setup metadata
//! between tunnel peers.
//!
//! Every participant gets a numeric address from the bus. Packets are either
//! broadcast to every subscriber of a topic or addressed to one participant.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod koshare;
pub mod local;

pub use koshare::KoshareClient;
pub use local::{LocalBus, LocalBusClient};

/// Bus-assigned participant address.
pub type BusAddress = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Broadcast,
    Message,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusPacket {
    pub kind: PacketKind,
    pub topic: String,
    pub src: BusAddress,
    pub body: Value,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus rejected request on {topic}: {reason}")]
    Rejected { topic: String, reason: String },
}

pub type BusResult<T> = Result<T, BusError>;

/// Receiving half of a topic subscription. Dropping it stops delivery to this
/// subscriber only; use [`Bus::unsubscribe`] to leave the topic.
pub type Subscription = mpsc::UnboundedReceiver<BusPacket>;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Joins `topic`; packets published after the call returns are delivered.
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription>;

    /// Drops every local subscriber of `topic` and leaves it.
    async fn unsubscribe(&self, topic: &str) -> BusResult<()>;

    async fn broadcast(&self, topic: &str, body: Value) -> BusResult<()>;

    async fn message(&self, topic: &str, destination: BusAddress, body: Value) -> BusResult<()>;

    /// Releases the connection. Calling it more than once is a no-op.
    fn close(&self);
}

/// Fans a packet out to the live subscribers in `senders`, pruning the ones
/// whose receiver has been dropped.
pub(crate) fn deliver(senders: &mut Vec<mpsc::UnboundedSender<BusPacket>>, packet: &BusPacket) {
    senders.retain(|sender| sender.send(packet.clone()).is_ok());
}
