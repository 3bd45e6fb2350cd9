use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use signal_bus::{Bus, BusAddress, BusPacket, Subscription};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::messages::{IceCandidateMessage, PeerId, PingMessage, PongMessage};
use super::{SignalError, SignalTransport};

const PING_TOPIC: &str = "ping";
const PONG_TOPIC: &str = "pong";
const CANDIDATE_TOPIC: &str = "ice-candidate";

/// Ping and pong bodies carry the operation id next to the message fields.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    id: u64,
    #[serde(flatten)]
    message: T,
}

/// [`SignalTransport`] over a publish/subscribe [`Bus`].
///
/// Pings are broadcast; pongs and candidates are sent point-to-point to the
/// bus address learned from the peer's last ping or pong. Messages for a peer
/// whose address is not yet known are dropped.
pub struct BusSignalTransport {
    bus: Arc<dyn Bus>,
    namespace: String,
    addresses: Arc<Mutex<HashMap<PeerId, BusAddress>>>,
    inbound_pings: Arc<Mutex<HashMap<PeerId, u64>>>,
    pending: Arc<PendingPongs>,
    next_operation: AtomicU64,
    pong_pump: OnceCell<()>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BusSignalTransport {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self::with_namespace(bus, "")
    }

    /// Prefixes every topic with `namespace`, isolating tunnels sharing a bus.
    pub fn with_namespace(bus: Arc<dyn Bus>, namespace: impl Into<String>) -> Self {
        Self {
            bus,
            namespace: namespace.into(),
            addresses: Arc::new(Mutex::new(HashMap::new())),
            inbound_pings: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_operation: AtomicU64::new(1),
            pong_pump: OnceCell::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn topic(&self, name: &str) -> String {
        format!("{}{}", self.namespace, name)
    }

    fn ensure_open(&self) -> Result<(), SignalError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SignalError::Closed)
        } else {
            Ok(())
        }
    }

    fn address_of(&self, peer: &str) -> Option<BusAddress> {
        self.addresses.lock().get(peer).copied()
    }

    async fn ensure_pong_pump(&self) -> Result<(), SignalError> {
        self.pong_pump
            .get_or_try_init(|| async {
                let subscription = self.bus.subscribe(&self.topic(PONG_TOPIC)).await?;
                let addresses = Arc::clone(&self.addresses);
                let pending = Arc::clone(&self.pending);
                let orphaned = Arc::clone(&self.pending);
                let task = tokio::spawn(pump(
                    subscription,
                    move |packet, envelope: Envelope<PongMessage>| {
                        addresses
                            .lock()
                            .insert(envelope.message.source_id.clone(), packet.src);
                        match pending.lock().remove(&envelope.id) {
                            Some(waiter) => {
                                let _ = waiter.send(envelope.message);
                            }
                            None => tracing::debug!(
                                target = "rtc_tunnel::signal",
                                id = envelope.id,
                                "pong for unknown ping"
                            ),
                        }
                    },
                    // The bus went away: outstanding pings can never be answered.
                    move || orphaned.lock().clear(),
                ));
                self.tasks.lock().push(task);
                Ok::<(), SignalError>(())
            })
            .await?;
        Ok(())
    }
}

type PendingPongs = Mutex<HashMap<u64, oneshot::Sender<PongMessage>>>;

/// Forgets a ping's waiter when `send_ping` returns or is cancelled.
struct PendingPing<'a> {
    pending: &'a PendingPongs,
    id: u64,
}

impl Drop for PendingPing<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Decodes every packet of `subscription` as `T` and hands it to `handle`;
/// runs `finished` once the subscription ends.
async fn pump<T, H, F>(mut subscription: Subscription, mut handle: H, finished: F)
where
    T: DeserializeOwned,
    H: FnMut(&BusPacket, T),
    F: FnOnce(),
{
    while let Some(packet) = subscription.recv().await {
        match serde_json::from_value::<T>(packet.body.clone()) {
            Ok(message) => handle(&packet, message),
            Err(err) => tracing::warn!(
                target = "rtc_tunnel::signal",
                topic = %packet.topic,
                src = packet.src,
                error = %err,
                "dropping malformed signal packet"
            ),
        }
    }
    finished();
}

#[async_trait]
impl SignalTransport for BusSignalTransport {
    async fn send_ping(&self, ping: PingMessage) -> Result<PongMessage, SignalError> {
        self.ensure_open()?;
        self.ensure_pong_pump().await?;
        let id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _waiting = PendingPing {
            pending: &self.pending,
            id,
        };
        let body = serde_json::to_value(Envelope { id, message: ping })?;
        self.bus.broadcast(&self.topic(PING_TOPIC), body).await?;
        rx.await.map_err(|_| SignalError::Closed)
    }

    async fn on_ping(&self, handler: mpsc::UnboundedSender<PingMessage>) -> Result<(), SignalError> {
        self.ensure_open()?;
        let subscription = self.bus.subscribe(&self.topic(PING_TOPIC)).await?;
        let addresses = Arc::clone(&self.addresses);
        let inbound = Arc::clone(&self.inbound_pings);
        let task = tokio::spawn(pump(
            subscription,
            move |packet, envelope: Envelope<PingMessage>| {
                let source = envelope.message.source_id.clone();
                addresses.lock().insert(source.clone(), packet.src);
                inbound.lock().insert(source, envelope.id);
                let _ = handler.send(envelope.message);
            },
            || {},
        ));
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn send_pong(&self, ping: &PingMessage, pong: PongMessage) -> Result<(), SignalError> {
        self.ensure_open()?;
        let Some(address) = self.address_of(&ping.source_id) else {
            tracing::debug!(
                target = "rtc_tunnel::signal",
                remote_id = %ping.source_id,
                "dropping pong for unknown peer"
            );
            return Ok(());
        };
        let Some(id) = self.inbound_pings.lock().get(&ping.source_id).copied() else {
            tracing::debug!(
                target = "rtc_tunnel::signal",
                remote_id = %ping.source_id,
                "dropping pong without a matching ping"
            );
            return Ok(());
        };
        let body = serde_json::to_value(Envelope { id, message: pong })?;
        self.bus
            .message(&self.topic(PONG_TOPIC), address, body)
            .await?;
        Ok(())
    }

    async fn send_ice_candidate(&self, message: IceCandidateMessage) -> Result<(), SignalError> {
        self.ensure_open()?;
        let Some(address) = self.address_of(&message.destination_id) else {
            tracing::debug!(
                target = "rtc_tunnel::signal",
                remote_id = %message.destination_id,
                "dropping candidate for unknown peer"
            );
            return Ok(());
        };
        let body = serde_json::to_value(&message)?;
        self.bus
            .message(&self.topic(CANDIDATE_TOPIC), address, body)
            .await?;
        Ok(())
    }

    async fn on_ice_candidate(
        &self,
        handler: mpsc::UnboundedSender<IceCandidateMessage>,
    ) -> Result<(), SignalError> {
        self.ensure_open()?;
        let subscription = self.bus.subscribe(&self.topic(CANDIDATE_TOPIC)).await?;
        let task = tokio::spawn(pump(
            subscription,
            move |_, message: IceCandidateMessage| {
                let _ = handler.send(message);
            },
            || {},
        ));
        self.tasks.lock().push(task);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // Dropping the waiters fails every outstanding ping with `Closed`.
        self.pending.lock().clear();
        self.bus.close();
    }
}

impl Drop for BusSignalTransport {
    fn drop(&mut self) {
        self.close();
    }
}
