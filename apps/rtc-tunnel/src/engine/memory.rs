//! In-process loopback engine.
//!
//! Session descriptions carry a token naming the peer that produced them;
//! [`MemoryNetwork`] resolves tokens to peers. Two peers link once each holds
//! both descriptions and at least one remote candidate, mirroring how a real
//! engine needs the candidate exchange before it connects. Data channels keep
//! real byte counts in their outbound buffer, which only drains while the
//! network is not paused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use uuid::Uuid;

use super::{
    ChannelEvent, ChannelState, DataChannel, EngineError, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerState,
};
use crate::config::IceServer;
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

const SESSION_ATTRIBUTE: &str = "a=memory-session:";

/// Shared medium for [`MemoryPeer`]s; also acts as their factory.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    peers: Mutex<HashMap<String, Weak<PeerShared>>>,
    link_lock: Mutex<()>,
    paused: watch::Sender<bool>,
    fail_next: AtomicBool,
    next_port: AtomicU16,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(NetworkInner {
                peers: Mutex::new(HashMap::new()),
                link_lock: Mutex::new(()),
                paused,
                fail_next: AtomicBool::new(false),
                next_port: AtomicU16::new(50_000),
            }),
        }
    }

    /// Stops delivering channel frames; outbound buffers grow until resumed.
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    /// The next pair of peers that would connect reports `Failed` instead.
    pub fn fail_next_connection(&self) {
        self.inner.fail_next.store(true, Ordering::Release);
    }

    pub fn create_peer(&self) -> MemoryPeer {
        let token = Uuid::new_v4().simple().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerShared {
            token: token.clone(),
            network: Arc::clone(&self.inner),
            events: events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(PeerInner::default()),
        });
        self.inner
            .peers
            .lock()
            .insert(token, Arc::downgrade(&shared));
        MemoryPeer { shared }
    }
}

#[async_trait]
impl PeerConnectionFactory for MemoryNetwork {
    async fn create_peer_connection(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        Ok(Arc::new(self.create_peer()))
    }
}

struct PeerShared {
    token: String,
    network: Arc<NetworkInner>,
    events: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    state: Mutex<PeerInner>,
}

struct PeerInner {
    connection_state: PeerState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_token: Option<String>,
    remote_candidates: usize,
    linked: Option<Weak<PeerShared>>,
    unannounced: Vec<Arc<ChannelShared>>,
    channels: Vec<Weak<ChannelShared>>,
}

impl Default for PeerInner {
    fn default() -> Self {
        Self {
            connection_state: PeerState::New,
            local: None,
            remote: None,
            remote_token: None,
            remote_candidates: 0,
            linked: None,
            unannounced: Vec::new(),
            channels: Vec::new(),
        }
    }
}

impl PeerInner {
    fn ready_to_link(&self) -> bool {
        self.local.is_some()
            && self.remote.is_some()
            && self.remote_candidates > 0
            && self.linked.is_none()
            && matches!(
                self.connection_state,
                PeerState::New | PeerState::Connecting
            )
    }
}

impl PeerShared {
    fn set_state(&self, state: PeerState) {
        self.state.lock().connection_state = state;
        let _ = self.events.send(PeerEvent::StateChange(state));
    }

    fn new_channel(&self, label: &str) -> Arc<ChannelShared> {
        let channel = ChannelShared::new(label, self.network.paused.subscribe());
        self.state.lock().channels.push(Arc::downgrade(&channel));
        channel
    }

    fn try_link(self: &Arc<Self>) {
        let network = Arc::clone(&self.network);
        let _guard = network.link_lock.lock();

        let remote_token = {
            let inner = self.state.lock();
            if !inner.ready_to_link() {
                return;
            }
            inner.remote_token.clone()
        };
        let Some(remote) = remote_token
            .and_then(|token| network.peers.lock().get(&token).cloned())
            .and_then(|weak| weak.upgrade())
        else {
            return;
        };
        {
            let inner = remote.state.lock();
            if !inner.ready_to_link() || inner.remote_token.as_deref() != Some(self.token.as_str())
            {
                return;
            }
        }

        self.state.lock().linked = Some(Arc::downgrade(&remote));
        remote.state.lock().linked = Some(Arc::downgrade(self));
        self.set_state(PeerState::Connecting);
        remote.set_state(PeerState::Connecting);

        if network.fail_next.swap(false, Ordering::AcqRel) {
            tracing::debug!(target = "rtc_tunnel::engine", "injected connection failure");
            self.set_state(PeerState::Failed);
            remote.set_state(PeerState::Failed);
            return;
        }

        self.set_state(PeerState::Connected);
        remote.set_state(PeerState::Connected);

        let local_channels = std::mem::take(&mut self.state.lock().unannounced);
        let remote_channels = std::mem::take(&mut remote.state.lock().unannounced);
        for channel in local_channels {
            announce(&channel, &remote);
        }
        for channel in remote_channels {
            announce(&channel, self);
        }
    }

    fn remote_lost(&self) {
        let channels = {
            let mut inner = self.state.lock();
            if !matches!(
                inner.connection_state,
                PeerState::Connected | PeerState::Connecting
            ) {
                return;
            }
            inner.linked = None;
            std::mem::take(&mut inner.channels)
        };
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.close_pair();
        }
        self.set_state(PeerState::Disconnected);
        self.set_state(PeerState::Failed);
    }

    fn gather_candidates(&self) {
        let port = self.network.next_port.fetch_add(1, Ordering::Relaxed);
        let ufrag = self.token.chars().take(8).collect::<String>();
        for (foundation, (priority, kind)) in [(2_130_706_431u32, "host"), (1_694_498_815, "srflx")]
            .into_iter()
            .enumerate()
        {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{foundation} 1 udp {priority} 127.0.0.1 {port} typ {kind}"
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: Some(ufrag.clone()),
            };
            let _ = self.events.send(PeerEvent::IceCandidate(candidate));
        }
    }
}

/// Creates the remote end of `channel` on `remote` and opens both ends.
fn announce(channel: &Arc<ChannelShared>, remote: &Arc<PeerShared>) {
    let mirror = remote.new_channel(&channel.label);
    *channel.peer_end.lock() = Some(Arc::downgrade(&mirror));
    *mirror.peer_end.lock() = Some(Arc::downgrade(channel));
    let _ = remote
        .events
        .send(PeerEvent::DataChannel(Arc::new(MemoryChannel {
            shared: Arc::clone(&mirror),
        })));
    ChannelShared::open_pair(channel, &mirror);
}

fn session_token(description: &SessionDescription) -> Option<String> {
    description
        .sdp
        .lines()
        .find_map(|line| line.strip_prefix(SESSION_ATTRIBUTE))
        .map(|token| token.trim().to_string())
}

pub struct MemoryPeer {
    shared: Arc<PeerShared>,
}

impl MemoryPeer {
    pub fn token(&self) -> &str {
        &self.shared.token
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let token = &self.shared.token;
        SessionDescription {
            kind,
            sdp: format!(
                "v=0\r\no=- {token} 0 IN IP4 127.0.0.1\r\ns=-\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n{SESSION_ATTRIBUTE}{token}\r\n"
            ),
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let channel = self.shared.new_channel(label);
        let linked = {
            let mut inner = self.shared.state.lock();
            match inner.connection_state {
                PeerState::Closed | PeerState::Failed => return Err(EngineError::Closed),
                _ => {}
            }
            let linked = inner.linked.as_ref().and_then(Weak::upgrade);
            if linked.is_none() {
                inner.unannounced.push(Arc::clone(&channel));
            }
            linked
        };
        if let Some(remote) = linked {
            announce(&channel, &remote);
        }
        Ok(Arc::new(MemoryChannel { shared: channel }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let has_offer = matches!(
            self.shared.state.lock().remote.as_ref().map(|d| d.kind),
            Some(SdpKind::Offer)
        );
        if !has_offer {
            return Err(EngineError::Other(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        if session_token(&description).as_deref() != Some(self.shared.token.as_str()) {
            return Err(EngineError::Other(
                "local description was not created by this peer".into(),
            ));
        }
        self.shared.state.lock().local = Some(description);
        self.shared.gather_candidates();
        self.shared.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let token = session_token(&description)
            .ok_or_else(|| EngineError::Other("remote description has no session token".into()))?;
        {
            let mut inner = self.shared.state.lock();
            inner.remote_token = Some(token);
            inner.remote = Some(description);
        }
        self.shared.try_link();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        {
            let mut inner = self.shared.state.lock();
            if inner.remote.is_none() {
                return Err(EngineError::Other(format!(
                    "candidate {} added before the remote description",
                    candidate.candidate
                )));
            }
            inner.remote_candidates += 1;
        }
        self.shared.try_link();
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.shared.events_rx.lock().take()
    }

    fn connection_state(&self) -> PeerState {
        self.shared.state.lock().connection_state
    }

    async fn close(&self) -> Result<(), EngineError> {
        let (remote, channels) = {
            let mut inner = self.shared.state.lock();
            if inner.connection_state == PeerState::Closed {
                return Ok(());
            }
            inner.unannounced.clear();
            (
                inner.linked.take().and_then(|weak| weak.upgrade()),
                std::mem::take(&mut inner.channels),
            )
        };
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.close_pair();
        }
        self.shared.set_state(PeerState::Closed);
        if let Some(remote) = remote {
            remote.remote_lost();
        }
        self.shared.network.peers.lock().remove(&self.shared.token);
        Ok(())
    }
}

enum Frame {
    Data { data: Bytes, is_string: bool },
    Close,
}

struct ChannelShared {
    label: String,
    state: Mutex<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    low: Arc<Notify>,
    outbound: mpsc::UnboundedSender<Frame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    peer_end: Mutex<Option<Weak<ChannelShared>>>,
    paused: watch::Receiver<bool>,
}

impl ChannelShared {
    fn new(label: &str, paused: watch::Receiver<bool>) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            low: Arc::new(Notify::new()),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            peer_end: Mutex::new(None),
            paused,
        })
    }

    fn open_pair(a: &Arc<Self>, b: &Arc<Self>) {
        for (from, to) in [(a, b), (b, a)] {
            *from.state.lock() = ChannelState::Open;
            if let Some(frames) = from.outbound_rx.lock().take() {
                tokio::spawn(deliver(Arc::clone(from), Arc::clone(to), frames));
            }
        }
        let _ = a.events.send(ChannelEvent::Open);
        let _ = b.events.send(ChannelEvent::Open);
    }

    fn peer_end(&self) -> Option<Arc<Self>> {
        self.peer_end.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Marks this end closed; the first call emits `Close` and stops the
    /// delivery task.
    fn finish_close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ChannelState::Closed);
        if previous != ChannelState::Closed {
            let _ = self.outbound.send(Frame::Close);
            let _ = self.events.send(ChannelEvent::Close);
        }
    }

    fn close_pair(&self) {
        self.finish_close();
        if let Some(peer) = self.peer_end() {
            peer.finish_close();
        }
    }

    fn release(&self, len: usize) {
        let before = self.buffered.fetch_sub(len, Ordering::AcqRel);
        let after = before.saturating_sub(len);
        let threshold = self.low_threshold.load(Ordering::Acquire);
        if before > threshold && after <= threshold {
            self.low.notify_one();
        }
    }
}

async fn deliver(
    from: Arc<ChannelShared>,
    to: Arc<ChannelShared>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    let mut paused = from.paused.clone();
    while let Some(frame) = frames.recv().await {
        let running = paused.wait_for(|paused| !*paused).await.is_ok();
        if !running {
            break;
        }
        match frame {
            Frame::Data { data, is_string } => {
                let len = data.len();
                if *to.state.lock() == ChannelState::Open {
                    let _ = to.events.send(ChannelEvent::Message { data, is_string });
                }
                from.release(len);
            }
            Frame::Close => {
                from.finish_close();
                to.finish_close();
                break;
            }
        }
    }
}

pub struct MemoryChannel {
    shared: Arc<ChannelShared>,
}

impl MemoryChannel {
    fn enqueue(&self, data: Bytes, is_string: bool) -> Result<usize, EngineError> {
        if *self.shared.state.lock() != ChannelState::Open {
            return Err(EngineError::ChannelNotOpen(self.shared.label.clone()));
        }
        let len = data.len();
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        if self
            .shared
            .outbound
            .send(Frame::Data { data, is_string })
            .is_err()
        {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(EngineError::ChannelNotOpen(self.shared.label.clone()));
        }
        Ok(len)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.shared.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    async fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.shared.low_threshold.store(threshold, Ordering::Release);
    }

    fn buffered_amount_low(&self) -> Arc<Notify> {
        Arc::clone(&self.shared.low)
    }

    async fn send(&self, data: Bytes) -> Result<usize, EngineError> {
        self.enqueue(data, false)
    }

    async fn send_text(&self, text: String) -> Result<usize, EngineError> {
        self.enqueue(Bytes::from(text), true)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.shared.events_rx.lock().take()
    }

    /// Pending frames are still delivered before the remote end sees `Close`.
    async fn close(&self) -> Result<(), EngineError> {
        let previous = {
            let mut state = self.shared.state.lock();
            let previous = *state;
            if previous == ChannelState::Open {
                *state = ChannelState::Closing;
            }
            previous
        };
        match previous {
            ChannelState::Open => {
                let _ = self.shared.outbound.send(Frame::Close);
            }
            ChannelState::Connecting => self.shared.finish_close(),
            ChannelState::Closing | ChannelState::Closed => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Linked {
        a: MemoryPeer,
        b: MemoryPeer,
        a_events: mpsc::UnboundedReceiver<PeerEvent>,
        b_events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn next_candidate(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> IceCandidate {
        loop {
            match events.try_recv().expect("pending event") {
                PeerEvent::IceCandidate(candidate) => return candidate,
                _ => continue,
            }
        }
    }

    async fn link(
        network: &MemoryNetwork,
        a_channel: Option<&str>,
    ) -> (Linked, Option<Arc<dyn DataChannel>>) {
        let a = network.create_peer();
        let b = network.create_peer();
        let mut a_events = a.take_events().expect("a events");
        let mut b_events = b.take_events().expect("b events");
        let channel = match a_channel {
            Some(label) => Some(a.create_data_channel(label).await.expect("channel")),
            None => None,
        };

        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer.clone()).await.expect("local offer");
        b.set_remote_description(offer).await.expect("remote offer");
        let answer = b.create_answer().await.expect("answer");
        b.set_local_description(answer.clone()).await.expect("local answer");
        a.set_remote_description(answer).await.expect("remote answer");

        let from_a = next_candidate(&mut a_events);
        let from_b = next_candidate(&mut b_events);
        b.add_ice_candidate(from_a).await.expect("candidate for b");
        a.add_ice_candidate(from_b).await.expect("candidate for a");

        (
            Linked {
                a,
                b,
                a_events,
                b_events,
            },
            channel,
        )
    }

    fn states(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerState> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PeerEvent::StateChange(state) = event {
                seen.push(state);
            }
        }
        seen
    }

    async fn remote_channel(
        events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Arc<dyn DataChannel> {
        loop {
            match events.recv().await.expect("peer event") {
                PeerEvent::DataChannel(channel) => return channel,
                _ => continue,
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn peers_connect_after_candidate_exchange() {
        let network = MemoryNetwork::new();
        let (mut linked, _) = link(&network, None).await;
        assert_eq!(linked.a.connection_state(), PeerState::Connected);
        assert_eq!(linked.b.connection_state(), PeerState::Connected);
        assert_eq!(
            states(&mut linked.b_events),
            vec![PeerState::Connecting, PeerState::Connected]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidate_before_remote_description_is_rejected() {
        let network = MemoryNetwork::new();
        let a = network.create_peer();
        let b = network.create_peer();
        let mut a_events = a.take_events().expect("events");
        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer).await.expect("local");
        let candidate = next_candidate(&mut a_events);
        assert!(b.add_ice_candidate(candidate).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn pre_negotiated_channel_opens_on_both_sides() {
        let network = MemoryNetwork::new();
        let (mut linked, channel) = link(&network, Some("control")).await;
        let local = channel.expect("local channel");
        let remote = remote_channel(&mut linked.b_events).await;
        assert_eq!(remote.label(), "control");

        let mut local_events = local.take_events().expect("local events");
        let mut remote_events = remote.take_events().expect("remote events");
        assert_eq!(local_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Open));

        local.send(Bytes::from_static(b"ping")).await.expect("send");
        assert_eq!(
            remote_events.recv().await,
            Some(ChannelEvent::Message {
                data: Bytes::from_static(b"ping"),
                is_string: false
            })
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn paused_network_accumulates_buffered_bytes() {
        let network = MemoryNetwork::new();
        let (mut linked, _) = link(&network, None).await;
        let local = linked.a.create_data_channel("bulk").await.expect("channel");
        let remote = remote_channel(&mut linked.b_events).await;
        let mut remote_events = remote.take_events().expect("events");
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Open));

        local.set_buffered_amount_low_threshold(10).await;
        let low = local.buffered_amount_low();
        network.pause();
        local.send(Bytes::from(vec![0u8; 64])).await.expect("send");
        local.send(Bytes::from(vec![0u8; 64])).await.expect("send");
        assert_eq!(local.buffered_amount().await, 128);

        network.resume();
        low.notified().await;
        assert_eq!(local.buffered_amount().await, 0);
        for _ in 0..2 {
            assert!(matches!(
                remote_events.recv().await,
                Some(ChannelEvent::Message { .. })
            ));
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_flushes_pending_frames_first() {
        let network = MemoryNetwork::new();
        let (mut linked, _) = link(&network, None).await;
        let local = linked.a.create_data_channel("s").await.expect("channel");
        let remote = remote_channel(&mut linked.b_events).await;
        let mut remote_events = remote.take_events().expect("events");
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Open));

        local.send(Bytes::from_static(b"last")).await.expect("send");
        local.close().await.expect("close");
        assert!(matches!(
            remote_events.recv().await,
            Some(ChannelEvent::Message { .. })
        ));
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(remote.ready_state(), ChannelState::Closed);
        assert!(remote.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn injected_failure_fails_both_peers() {
        let network = MemoryNetwork::new();
        network.fail_next_connection();
        let (mut linked, _) = link(&network, None).await;
        assert_eq!(linked.a.connection_state(), PeerState::Failed);
        assert_eq!(
            states(&mut linked.a_events),
            vec![PeerState::Connecting, PeerState::Failed]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn closing_a_peer_fails_the_remote() {
        let network = MemoryNetwork::new();
        let (mut linked, _) = link(&network, None).await;
        states(&mut linked.b_events);
        linked.a.close().await.expect("close");
        assert_eq!(linked.a.connection_state(), PeerState::Closed);
        assert_eq!(
            states(&mut linked.b_events),
            vec![PeerState::Disconnected, PeerState::Failed]
        );
    }
}
