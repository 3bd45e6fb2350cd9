use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ChannelEvent, ChannelState, DataChannel, EngineError, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerState,
};
use crate::config::IceServer;
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

/// Peer connections backed by webrtc-rs.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Self {
        Self {
            api: APIBuilder::new().build(),
        }
    }
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcEngine {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let peer_connection = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(EngineError::setup)?;
        Ok(Arc::new(WebRtcPeer::wrap(Arc::new(peer_connection))))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

pub struct WebRtcPeer {
    inner: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl WebRtcPeer {
    fn wrap(peer_connection: Arc<RTCPeerConnection>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        tracing::trace!(
                            target = "rtc_tunnel::engine",
                            candidate = %init.candidate,
                            "local candidate gathered"
                        );
                        let _ = tx.send(PeerEvent::IceCandidate(from_candidate_init(init)));
                    }
                    Err(err) => {
                        tracing::warn!(target = "rtc_tunnel::engine", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_tx = events_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                Box::pin(async move {
                    tracing::debug!(target = "rtc_tunnel::engine", state = ?state, "peer connection state changed");
                    if let Some(state) = map_peer_state(state) {
                        let _ = tx.send(PeerEvent::StateChange(state));
                    }
                })
            },
        ));

        let channel_tx = events_tx;
        peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = channel_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "rtc_tunnel::engine", label = %dc.label(), "remote data channel announced");
                let channel = WebRtcChannel::wrap(dc).await;
                let _ = tx.send(PeerEvent::DataChannel(Arc::new(channel)));
            })
        }));

        Self {
            inner: peer_connection,
            events: Mutex::new(Some(events_rx)),
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .inner
            .create_data_channel(label, Some(init))
            .await
            .map_err(EngineError::other)?;
        Ok(Arc::new(WebRtcChannel::wrap(dc).await))
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(EngineError::other)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .inner
            .create_answer(None)
            .await
            .map_err(EngineError::other)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.inner
            .set_local_description(description)
            .await
            .map_err(EngineError::other)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc_description(description)?;
        self.inner
            .set_remote_description(description)
            .await
            .map_err(EngineError::other)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.inner
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(EngineError::other)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().take()
    }

    fn connection_state(&self) -> PeerState {
        map_peer_state(self.inner.connection_state()).unwrap_or(PeerState::New)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.inner.close().await.map_err(EngineError::other)
    }
}

pub struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
    low: Arc<Notify>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl WebRtcChannel {
    async fn wrap(dc: Arc<RTCDataChannel>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let label = dc.label().to_string();

        let open_tx = events_tx.clone();
        dc.on_open(Box::new(move || {
            let tx = open_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Open);
            })
        }));

        let close_tx = events_tx.clone();
        dc.on_close(Box::new(move || {
            let tx = close_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Close);
            })
        }));

        let error_tx = events_tx.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            let tx = error_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Error(err.to_string()));
            })
        }));

        let message_tx = events_tx;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = message_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Message {
                    data: msg.data,
                    is_string: msg.is_string,
                });
            })
        }));

        let low = Arc::new(Notify::new());
        let low_for_handler = Arc::clone(&low);
        dc.on_buffered_amount_low(Box::new(move || {
            let low = Arc::clone(&low_for_handler);
            Box::pin(async move {
                low.notify_one();
            })
        }))
        .await;

        Self {
            inner: dc,
            label,
            low,
            events: Mutex::new(Some(events_rx)),
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.inner.set_buffered_amount_low_threshold(threshold).await;
    }

    fn buffered_amount_low(&self) -> Arc<Notify> {
        Arc::clone(&self.low)
    }

    async fn send(&self, data: Bytes) -> Result<usize, EngineError> {
        self.inner.send(&data).await.map_err(EngineError::other)
    }

    async fn send_text(&self, text: String) -> Result<usize, EngineError> {
        self.inner.send_text(text).await.map_err(EngineError::other)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.inner.close().await.map_err(EngineError::other)
    }
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => return None,
    })
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, EngineError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(EngineError::Other(format!(
                "unsupported session description type {other:?}"
            )));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, EngineError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(EngineError::other)
}
