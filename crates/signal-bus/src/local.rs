use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{deliver, Bus, BusAddress, BusError, BusPacket, BusResult, PacketKind, Subscription};

type TopicSenders = HashMap<String, Vec<mpsc::UnboundedSender<BusPacket>>>;

/// Simple in-memory bus for tests and in-process tunnels.
///
/// Each [`LocalBus::endpoint`] behaves like a separate connection to a router:
/// it receives its own address, broadcasts never loop back to the sender and
/// messages reach only the addressed endpoint.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    hub: Arc<Hub>,
}

#[derive(Debug, Default)]
struct Hub {
    next_address: AtomicU64,
    endpoints: RwLock<HashMap<BusAddress, TopicSenders>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> LocalBusClient {
        let address = self.hub.next_address.fetch_add(1, Ordering::Relaxed) + 1;
        self.hub.endpoints.write().insert(address, HashMap::new());
        LocalBusClient {
            hub: Arc::clone(&self.hub),
            address,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of endpoints that have not been closed.
    pub fn endpoint_count(&self) -> usize {
        self.hub.endpoints.read().len()
    }
}

#[derive(Debug)]
pub struct LocalBusClient {
    hub: Arc<Hub>,
    address: BusAddress,
    closed: AtomicBool,
}

impl LocalBusClient {
    pub fn address(&self) -> BusAddress {
        self.address
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Bus for LocalBusClient {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut endpoints = self.hub.endpoints.write();
        let topics = endpoints.get_mut(&self.address).ok_or(BusError::Closed)?;
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> BusResult<()> {
        self.ensure_open()?;
        if let Some(topics) = self.hub.endpoints.write().get_mut(&self.address) {
            topics.remove(topic);
        }
        Ok(())
    }

    async fn broadcast(&self, topic: &str, body: Value) -> BusResult<()> {
        self.ensure_open()?;
        let packet = BusPacket {
            kind: PacketKind::Broadcast,
            topic: topic.to_string(),
            src: self.address,
            body,
        };
        let mut endpoints = self.hub.endpoints.write();
        for (address, topics) in endpoints.iter_mut() {
            if *address == self.address {
                continue;
            }
            if let Some(senders) = topics.get_mut(topic) {
                deliver(senders, &packet);
            }
        }
        Ok(())
    }

    async fn message(&self, topic: &str, destination: BusAddress, body: Value) -> BusResult<()> {
        self.ensure_open()?;
        let packet = BusPacket {
            kind: PacketKind::Message,
            topic: topic.to_string(),
            src: self.address,
            body,
        };
        let mut endpoints = self.hub.endpoints.write();
        match endpoints
            .get_mut(&destination)
            .and_then(|topics| topics.get_mut(topic))
        {
            Some(senders) => deliver(senders, &packet),
            None => {
                tracing::debug!(
                    target = "signal_bus::local",
                    topic,
                    destination,
                    "dropping message for endpoint without subscription"
                );
            }
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.endpoints.write().remove(&self.address);
    }
}

impl Drop for LocalBusClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::tokio_timeout_test]
    async fn broadcast_reaches_other_endpoints_only() {
        let bus = LocalBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();
        let mut sub_a = a.subscribe("ping").await.expect("subscribe a");
        let mut sub_b = b.subscribe("ping").await.expect("subscribe b");

        a.broadcast("ping", json!({"hello": 1})).await.expect("broadcast");

        let packet = sub_b.recv().await.expect("packet for b");
        assert_eq!(packet.kind, PacketKind::Broadcast);
        assert_eq!(packet.src, a.address());
        assert_eq!(packet.body, json!({"hello": 1}));
        assert!(sub_a.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn message_is_point_to_point() {
        let bus = LocalBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();
        let c = bus.endpoint();
        let mut sub_b = b.subscribe("pong").await.expect("subscribe b");
        let mut sub_c = c.subscribe("pong").await.expect("subscribe c");

        a.message("pong", b.address(), json!("hi")).await.expect("message");

        let packet = sub_b.recv().await.expect("packet for b");
        assert_eq!(packet.kind, PacketKind::Message);
        assert_eq!(packet.body, json!("hi"));
        assert!(sub_c.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn message_to_unknown_endpoint_is_dropped() {
        let bus = LocalBus::new();
        let a = bus.endpoint();
        a.message("pong", 999, json!(null)).await.expect("dropped silently");
    }

    #[test_timeout::tokio_timeout_test]
    async fn unsubscribe_stops_delivery() {
        let bus = LocalBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();
        let mut sub_b = b.subscribe("ping").await.expect("subscribe");
        b.unsubscribe("ping").await.expect("unsubscribe");
        a.broadcast("ping", json!(1)).await.expect("broadcast");
        assert!(sub_b.recv().await.is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent_and_rejects_further_use() {
        let bus = LocalBus::new();
        let a = bus.endpoint();
        assert_eq!(bus.endpoint_count(), 1);
        a.close();
        a.close();
        assert_eq!(bus.endpoint_count(), 0);
        assert!(matches!(
            a.broadcast("ping", json!(1)).await,
            Err(BusError::Closed)
        ));
    }
}
