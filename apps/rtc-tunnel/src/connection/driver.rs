//! The one task per connection that owns the peer connection's event stream.
//!
//! It queues local candidates until signaling can carry them, holds remote
//! candidates back until the remote description is applied, folds engine
//! state notifications into [`EstablishmentState`] and hands remotely opened
//! channels to the connection.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::candidates::CandidateQueue;
use super::state::{self, EstablishmentState, StateTracker};
use crate::engine::{DataChannel, EngineError, PeerConnection, PeerEvent};
use crate::signal::{IceCandidate, SessionDescription};

enum Command {
    ForwardCandidates(mpsc::UnboundedSender<IceCandidate>),
    ApplyRemoteDescription {
        description: SessionDescription,
        done: oneshot::Sender<Result<(), EngineError>>,
    },
}

pub(crate) struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    /// Starts sending local candidates to `sink`, oldest first.
    pub(crate) fn forward_candidates(&self, sink: mpsc::UnboundedSender<IceCandidate>) {
        let _ = self.commands.send(Command::ForwardCandidates(sink));
    }

    /// Applies the remote description, then any remote candidates that
    /// arrived ahead of it.
    pub(crate) async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::ApplyRemoteDescription { description, done })
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) struct Spawned {
    pub(crate) handle: DriverHandle,
    pub(crate) incoming: mpsc::UnboundedReceiver<Arc<dyn DataChannel>>,
}

pub(crate) fn spawn(
    remote_id: String,
    peer: Arc<dyn PeerConnection>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    remote_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    state: Arc<watch::Sender<EstablishmentState>>,
) -> Spawned {
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming) = mpsc::unbounded_channel();
    let driver = PeerDriver {
        remote_id,
        peer,
        state,
        tracker: StateTracker::default(),
        local: CandidateQueue::default(),
        remote_pending: Vec::new(),
        remote_described: false,
        incoming: incoming_tx,
    };
    let task = tokio::spawn(driver.run(events, commands_rx, remote_candidates));
    Spawned {
        handle: DriverHandle { commands, task },
        incoming,
    }
}

struct PeerDriver {
    remote_id: String,
    peer: Arc<dyn PeerConnection>,
    state: Arc<watch::Sender<EstablishmentState>>,
    tracker: StateTracker,
    local: CandidateQueue<IceCandidate>,
    remote_pending: Vec<IceCandidate>,
    remote_described: bool,
    incoming: mpsc::UnboundedSender<Arc<dyn DataChannel>>,
}

impl PeerDriver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut remote_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    ) {
        let mut events_open = true;
        let mut candidates_open = true;
        loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_event(event),
                    None => events_open = false,
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                candidate = remote_candidates.recv(), if candidates_open => match candidate {
                    Some(candidate) => self.on_remote_candidate(candidate).await,
                    None => candidates_open = false,
                },
            }
        }
    }

    fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                tracing::trace!(
                    target = "rtc_tunnel::connection",
                    remote_id = %self.remote_id,
                    candidate = %candidate.candidate,
                    live = self.local.is_live(),
                    "local candidate"
                );
                self.local.push(candidate);
            }
            PeerEvent::StateChange(peer_state) => {
                let Some(peer_state) = self.tracker.observe(peer_state) else {
                    return;
                };
                let current = *self.state.borrow();
                tracing::debug!(
                    target = "rtc_tunnel::connection",
                    remote_id = %self.remote_id,
                    state = ?peer_state,
                    "peer connection state"
                );
                if let Some(next) = state::on_peer_state(current, peer_state) {
                    state::advance(&self.state, next);
                }
            }
            PeerEvent::DataChannel(channel) => {
                tracing::debug!(
                    target = "rtc_tunnel::connection",
                    remote_id = %self.remote_id,
                    label = %channel.label(),
                    "remote opened channel"
                );
                let _ = self.incoming.send(channel);
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::ForwardCandidates(sink) => self.local.attach(sink),
            Command::ApplyRemoteDescription { description, done } => {
                let result = self.peer.set_remote_description(description).await;
                if result.is_ok() {
                    self.remote_described = true;
                    state::advance(&self.state, EstablishmentState::IceExchanging);
                    for candidate in std::mem::take(&mut self.remote_pending) {
                        self.apply_candidate(candidate).await;
                    }
                }
                let _ = done.send(result);
            }
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_described {
            self.apply_candidate(candidate).await;
        } else {
            self.remote_pending.push(candidate);
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(err) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!(
                target = "rtc_tunnel::connection",
                remote_id = %self.remote_id,
                error = %err,
                "failed to add remote candidate"
            );
        }
    }
}
