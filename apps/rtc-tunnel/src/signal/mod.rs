//! Session-setup signaling between tunnel peers.
//!
//! An initiator pings a responder with its offer and waits for the matching
//! pong; both sides then trickle ICE candidates to each other. The transport
//! carrying these messages is pluggable through [`SignalTransport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_bus::BusError;
use thiserror::Error;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;

pub mod bus_transport;
pub mod messages;
pub mod registry;

pub use bus_transport::BusSignalTransport;
pub use messages::{
    IceCandidate, IceCandidateMessage, PeerId, PingMessage, PongMessage, SdpKind,
    SessionDescription,
};
pub use registry::{CandidateRegistry, ListenerId};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal transport error: {0}")]
    Transport(String),
    #[error("signal transport closed")]
    Closed,
    #[error("malformed signal payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<BusError> for SignalError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Closed => SignalError::Closed,
            other => SignalError::Transport(other.to_string()),
        }
    }
}

/// Capability for moving signaling messages between peers.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Sends `ping` and resolves with the single pong that answers it.
    async fn send_ping(&self, ping: PingMessage) -> Result<PongMessage, SignalError>;

    /// Registers a receiver for every inbound ping, whatever its destination.
    async fn on_ping(&self, handler: mpsc::UnboundedSender<PingMessage>) -> Result<(), SignalError>;

    async fn send_pong(&self, ping: &PingMessage, pong: PongMessage) -> Result<(), SignalError>;

    async fn send_ice_candidate(&self, message: IceCandidateMessage) -> Result<(), SignalError>;

    async fn on_ice_candidate(
        &self,
        handler: mpsc::UnboundedSender<IceCandidateMessage>,
    ) -> Result<(), SignalError>;

    fn close(&self);
}

struct SignalCore {
    id: PeerId,
    transport: Arc<dyn SignalTransport>,
    registry: Arc<CandidateRegistry>,
    candidate_handler: OnceCell<()>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalCore {
    fn new(id: PeerId, transport: Arc<dyn SignalTransport>) -> Self {
        Self {
            id,
            transport,
            registry: Arc::new(CandidateRegistry::default()),
            candidate_handler: OnceCell::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn ensure_open(&self) -> Result<(), SignalError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SignalError::Closed)
        } else {
            Ok(())
        }
    }

    async fn ensure_candidate_handler(&self) -> Result<(), SignalError> {
        self.candidate_handler
            .get_or_try_init(|| async {
                let (tx, mut rx) = mpsc::unbounded_channel::<IceCandidateMessage>();
                self.transport.on_ice_candidate(tx).await?;
                let registry = Arc::clone(&self.registry);
                let local_id = self.id.clone();
                let task = tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        if message.destination_id != local_id {
                            tracing::debug!(
                                target = "rtc_tunnel::signal",
                                destination_id = %message.destination_id,
                                "ignoring candidate addressed elsewhere"
                            );
                            continue;
                        }
                        registry.dispatch(&message);
                    }
                });
                self.tasks.lock().push(task);
                Ok::<(), SignalError>(())
            })
            .await?;
        Ok(())
    }

    async fn send_ice_candidate(
        &self,
        remote_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalError> {
        self.ensure_open()?;
        self.transport
            .send_ice_candidate(IceCandidateMessage {
                source_id: self.id.clone(),
                destination_id: remote_id.to_string(),
                candidate,
            })
            .await
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target = "rtc_tunnel::signal", id = %self.id, "closing signal");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.close();
    }
}

impl Drop for SignalCore {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

macro_rules! candidate_methods {
    () => {
        pub fn id(&self) -> &str {
            &self.core.id
        }

        pub async fn send_ice_candidate(
            &self,
            remote_id: &str,
            candidate: IceCandidate,
        ) -> Result<(), SignalError> {
            self.core.send_ice_candidate(remote_id, candidate).await
        }

        pub fn add_ice_candidate_listener(
            &self,
            remote_id: &str,
            listener: mpsc::UnboundedSender<IceCandidate>,
        ) -> ListenerId {
            self.core.registry.add(remote_id, listener)
        }

        pub fn remove_ice_candidate_listener(&self, remote_id: &str, id: ListenerId) -> bool {
            self.core.registry.remove(remote_id, id)
        }

        /// Releases the transport. Safe to call repeatedly.
        pub fn close(&self) {
            self.core.close();
        }
    };
}

/// Signaling role of the side that sends the offer.
#[derive(Clone)]
pub struct SignalInitiator {
    core: Arc<SignalCore>,
}

impl SignalInitiator {
    pub fn new(id: impl Into<PeerId>, transport: Arc<dyn SignalTransport>) -> Self {
        Self {
            core: Arc::new(SignalCore::new(id.into(), transport)),
        }
    }

    candidate_methods!();

    /// Offers a session to `remote_id`. No timeout is applied; wrap the call
    /// if one is needed.
    pub async fn ping(
        &self,
        remote_id: &str,
        offer: SessionDescription,
    ) -> Result<PongMessage, SignalError> {
        self.core.ensure_open()?;
        self.core.ensure_candidate_handler().await?;
        tracing::debug!(
            target = "rtc_tunnel::signal",
            remote_id,
            "sending ping"
        );
        self.core
            .transport
            .send_ping(PingMessage {
                source_id: self.core.id.clone(),
                destination_id: remote_id.to_string(),
                offer,
            })
            .await
    }
}

/// Signaling role of the side that answers offers addressed to its id.
#[derive(Clone)]
pub struct SignalResponder {
    core: Arc<SignalCore>,
    ping_handler: Arc<OnceCell<()>>,
    handlers: Arc<Mutex<Vec<mpsc::UnboundedSender<PingMessage>>>>,
}

impl SignalResponder {
    pub fn new(id: impl Into<PeerId>, transport: Arc<dyn SignalTransport>) -> Self {
        Self {
            core: Arc::new(SignalCore::new(id.into(), transport)),
            ping_handler: Arc::new(OnceCell::new()),
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    candidate_methods!();

    /// Delivers every ping addressed to this responder's id to `handler`.
    pub async fn listen(
        &self,
        handler: mpsc::UnboundedSender<PingMessage>,
    ) -> Result<(), SignalError> {
        self.core.ensure_open()?;
        self.handlers.lock().push(handler);
        self.ping_handler
            .get_or_try_init(|| async {
                let (tx, mut rx) = mpsc::unbounded_channel::<PingMessage>();
                self.core.transport.on_ping(tx).await?;
                let handlers = Arc::clone(&self.handlers);
                let local_id = self.core.id.clone();
                let task = tokio::spawn(async move {
                    while let Some(ping) = rx.recv().await {
                        if ping.destination_id != local_id {
                            tracing::trace!(
                                target = "rtc_tunnel::signal",
                                destination_id = %ping.destination_id,
                                "ignoring ping for another responder"
                            );
                            continue;
                        }
                        tracing::debug!(
                            target = "rtc_tunnel::signal",
                            remote_id = %ping.source_id,
                            "received ping"
                        );
                        handlers
                            .lock()
                            .retain(|handler| handler.send(ping.clone()).is_ok());
                    }
                });
                self.core.tasks.lock().push(task);
                Ok::<(), SignalError>(())
            })
            .await?;
        self.core.ensure_candidate_handler().await
    }

    pub async fn pong(
        &self,
        ping: &PingMessage,
        answer: SessionDescription,
    ) -> Result<(), SignalError> {
        self.core.ensure_open()?;
        let pong = PongMessage {
            source_id: ping.destination_id.clone(),
            destination_id: ping.source_id.clone(),
            answer,
        };
        self.core.transport.send_pong(ping, pong).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_bus::LocalBus;

    fn pair(bus: &LocalBus) -> (SignalInitiator, SignalResponder) {
        let initiator =
            SignalInitiator::new("client", Arc::new(BusSignalTransport::new(Arc::new(bus.endpoint()))));
        let responder =
            SignalResponder::new("server", Arc::new(BusSignalTransport::new(Arc::new(bus.endpoint()))));
        (initiator, responder)
    }

    fn candidate(text: &str) -> IceCandidate {
        IceCandidate {
            candidate: text.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn ping_pong_round_trip() {
        let bus = LocalBus::new();
        let (initiator, responder) = pair(&bus);
        let (ping_tx, mut pings) = mpsc::unbounded_channel();
        responder.listen(ping_tx).await.expect("listen");

        let responder_task = tokio::spawn(async move {
            let ping = pings.recv().await.expect("ping");
            assert_eq!(ping.source_id, "client");
            assert_eq!(ping.offer, SessionDescription::offer("offer-sdp"));
            responder
                .pong(&ping, SessionDescription::answer("answer-sdp"))
                .await
                .expect("pong");
            responder
        });

        let pong = initiator
            .ping("server", SessionDescription::offer("offer-sdp"))
            .await
            .expect("pong");
        assert_eq!(pong.source_id, "server");
        assert_eq!(pong.destination_id, "client");
        assert_eq!(pong.answer, SessionDescription::answer("answer-sdp"));
        responder_task.await.expect("responder");
    }

    #[test_timeout::tokio_timeout_test]
    async fn pings_for_other_responders_are_filtered() {
        let bus = LocalBus::new();
        let (initiator, responder) = pair(&bus);
        let (ping_tx, mut pings) = mpsc::unbounded_channel();
        responder.listen(ping_tx).await.expect("listen");

        let stray = initiator.clone();
        tokio::spawn(async move {
            let _ = stray
                .ping("someone-else", SessionDescription::offer("x"))
                .await;
        });
        let initiator_for_real = initiator.clone();
        tokio::spawn(async move {
            let _ = initiator_for_real
                .ping("server", SessionDescription::offer("y"))
                .await;
        });

        let ping = pings.recv().await.expect("ping");
        assert_eq!(ping.offer.sdp, "y");
        assert!(pings.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_reach_listeners_for_their_source() {
        let bus = LocalBus::new();
        let (initiator, responder) = pair(&bus);
        let (ping_tx, mut pings) = mpsc::unbounded_channel();
        responder.listen(ping_tx).await.expect("listen");

        let (cand_tx, mut candidates) = mpsc::unbounded_channel();
        initiator.add_ice_candidate_listener("server", cand_tx);

        let responder_task = tokio::spawn(async move {
            let ping = pings.recv().await.expect("ping");
            responder
                .pong(&ping, SessionDescription::answer("a"))
                .await
                .expect("pong");
            responder
                .send_ice_candidate("client", candidate("c1"))
                .await
                .expect("candidate 1");
            responder
                .send_ice_candidate("client", candidate("c2"))
                .await
                .expect("candidate 2");
            responder
        });

        initiator
            .ping("server", SessionDescription::offer("o"))
            .await
            .expect("pong");
        assert_eq!(candidates.recv().await.expect("c1").candidate, "c1");
        assert_eq!(candidates.recv().await.expect("c2").candidate, "c2");
        responder_task.await.expect("responder");
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent_and_fails_later_pings() {
        let bus = LocalBus::new();
        let (initiator, _responder) = pair(&bus);
        initiator.close();
        initiator.close();
        assert!(matches!(
            initiator.ping("server", SessionDescription::offer("o")).await,
            Err(SignalError::Closed)
        ));
    }
}
