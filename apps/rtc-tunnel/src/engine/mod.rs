//! Peer-connection engine seam.
//!
//! The tunnel only needs a handful of engine capabilities: labeled data
//! channels, offer/answer exchange, trickled candidates, connection-state
//! transitions and outbound buffer accounting. [`webrtc`] binds them to
//! webrtc-rs; [`memory`] is an in-process loopback used by tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

use crate::config::IceServer;
use crate::signal::{IceCandidate, SessionDescription};

#[cfg(test)]
pub(crate) mod fake;
pub mod memory;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("data channel {0} is not open")]
    ChannelNotOpen(String),
    #[error("peer connection closed")]
    Closed,
    #[error("engine error: {0}")]
    Other(String),
}

impl EngineError {
    pub(crate) fn setup(err: impl std::fmt::Display) -> Self {
        EngineError::Setup(err.to_string())
    }

    pub(crate) fn other(err: impl std::fmt::Display) -> Self {
        EngineError::Other(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message { data: Bytes, is_string: bool },
    Error(String),
    Close,
}

pub enum PeerEvent {
    IceCandidate(IceCandidate),
    StateChange(PeerState),
    /// A channel opened by the remote side.
    DataChannel(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            PeerEvent::StateChange(state) => f.debug_tuple("StateChange").field(state).finish(),
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
        }
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    /// Bytes queued by the engine but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Notified when the buffered amount drops below the low threshold.
    fn buffered_amount_low(&self) -> Arc<Notify>;

    async fn send(&self, data: Bytes) -> Result<usize, EngineError>;

    async fn send_text(&self, text: String) -> Result<usize, EngineError>;

    /// Event stream for this channel, captured from the moment the handle was
    /// created. Can be taken once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Candidate, state and incoming-channel events. Can be taken once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    fn connection_state(&self) -> PeerState;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, EngineError>;
}
