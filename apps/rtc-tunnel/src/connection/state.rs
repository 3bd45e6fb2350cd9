use tokio::sync::watch;

use crate::engine::PeerState;

/// Lifecycle of one tunnel connection. Variants are ordered; a connection only
/// ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EstablishmentState {
    Idle,
    OfferOrAnswerPending,
    AwaitingRemoteDescription,
    IceExchanging,
    Connected,
    Failed,
    Closed,
}

impl EstablishmentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EstablishmentState::Failed | EstablishmentState::Closed)
    }
}

/// Moves `state` to `next` unless that would go backwards or leave a
/// terminal state. Returns whether it changed.
pub(crate) fn advance(state: &watch::Sender<EstablishmentState>, next: EstablishmentState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || next <= *current {
            return false;
        }
        *current = next;
        true
    })
}

/// Target state for an engine transition, if it matters at all.
pub(crate) fn on_peer_state(
    current: EstablishmentState,
    peer: PeerState,
) -> Option<EstablishmentState> {
    if current.is_terminal() {
        return None;
    }
    match peer {
        PeerState::Connected => Some(EstablishmentState::Connected),
        PeerState::Failed | PeerState::Closed if current == EstablishmentState::Connected => {
            Some(EstablishmentState::Closed)
        }
        PeerState::Failed | PeerState::Closed => Some(EstablishmentState::Failed),
        PeerState::New | PeerState::Connecting | PeerState::Disconnected => None,
    }
}

/// Drops engine notifications that repeat the previous one.
#[derive(Debug, Default)]
pub(crate) struct StateTracker {
    last: Option<PeerState>,
}

impl StateTracker {
    pub(crate) fn observe(&mut self, state: PeerState) -> Option<PeerState> {
        if self.last == Some(state) {
            return None;
        }
        self.last = Some(state);
        Some(state)
    }
}
