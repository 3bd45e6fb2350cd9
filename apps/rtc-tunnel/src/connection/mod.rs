//! Establishing tunnel connections and the runtime that outlives setup.
//!
//! [`connect`] drives the initiator side: offer, ping, apply the answer,
//! trickle candidates both ways and wait for the engine to connect. [`listen`]
//! answers pings addressed to the responder's id and yields one
//! [`Connection`] per successful exchange. Either side may then open
//! labeled streams; the control label is reserved for flow control.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{StreamConfig, TunnelConfig};
use crate::dispatcher::{ControlMessage, DispatchError, Dispatcher};
use crate::engine::{
    ChannelEvent, ChannelState, DataChannel, EngineError, PeerConnection, PeerConnectionFactory,
    PeerEvent,
};
use crate::signal::{
    IceCandidate, PingMessage, SignalError, SignalInitiator, SignalResponder,
};
use crate::stream::ChannelStream;

mod candidates;
mod driver;
mod state;

pub use state::EstablishmentState;

use driver::{DriverHandle, Spawned};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("peer connection to {0} failed")]
    ConnectionFailed(String),
    #[error("channel {0} closed before it opened")]
    ChannelClosedBeforeOpen(String),
    #[error("label {0} is reserved for the control channel")]
    ReservedLabel(String),
    #[error("label {0} is already used by an open stream")]
    LabelInUse(String),
    #[error("connection closed")]
    Closed,
}

/// Opens a connection to the responder registered as `remote_id`.
///
/// The signaling capability is closed when this returns, whether or not the
/// connection came up. No timeout is applied.
pub async fn connect(
    signal: SignalInitiator,
    remote_id: &str,
    factory: &dyn PeerConnectionFactory,
    config: &TunnelConfig,
) -> Result<Connection, ConnectError> {
    tracing::debug!(target = "rtc_tunnel::connection", remote_id, "connecting");
    let peer = factory.create_peer_connection(&config.ice_servers).await?;
    let result = initiate(&signal, remote_id, Arc::clone(&peer), config).await;
    signal.close();
    match result {
        Ok(connection) => Ok(connection),
        Err(err) => {
            tracing::warn!(
                target = "rtc_tunnel::connection",
                remote_id,
                error = %err,
                "connection attempt failed"
            );
            let _ = peer.close().await;
            Err(err)
        }
    }
}

async fn initiate(
    signal: &SignalInitiator,
    remote_id: &str,
    peer: Arc<dyn PeerConnection>,
    config: &TunnelConfig,
) -> Result<Connection, ConnectError> {
    let events = take_peer_events(peer.as_ref())?;
    let control = peer.create_data_channel(&config.control_label).await?;
    let state = Arc::new(watch::channel(EstablishmentState::Idle).0);

    // Listen before pinging: the responder may trickle before we see the pong.
    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    let listener = signal.add_ice_candidate_listener(remote_id, remote_tx);
    let Spawned {
        handle: driver,
        incoming,
    } = driver::spawn(
        remote_id.to_string(),
        Arc::clone(&peer),
        events,
        remote_rx,
        Arc::clone(&state),
    );

    state::advance(&state, EstablishmentState::OfferOrAnswerPending);
    let offer = peer.create_offer().await?;
    peer.set_local_description(offer.clone()).await?;
    state::advance(&state, EstablishmentState::AwaitingRemoteDescription);

    let pong = signal.ping(remote_id, offer).await?;
    let forwarder = {
        let signal = signal.clone();
        let remote = remote_id.to_string();
        spawn_candidate_forwarder(remote_id.to_string(), move |candidate| {
            let signal = signal.clone();
            let remote = remote.clone();
            async move { signal.send_ice_candidate(&remote, candidate).await }
        })
    };
    driver.forward_candidates(forwarder.sink.clone());
    driver.apply_remote_description(pong.answer).await?;

    if !wait_connected(&state).await {
        return Err(ConnectError::ConnectionFailed(remote_id.to_string()));
    }
    let control_events = wait_open(&control).await?;

    signal.remove_ice_candidate_listener(remote_id, listener);
    forwarder.task.abort();

    Ok(assemble(Parts {
        remote_id: remote_id.to_string(),
        config: config.clone(),
        peer,
        control,
        control_events,
        state,
        driver,
        incoming,
        parked: Vec::new(),
        tasks: Vec::new(),
        release: None,
    }))
}

/// Answers pings addressed to `signal`'s id until the listener is closed or
/// dropped. A failed exchange is logged and does not affect later ones.
pub async fn listen(
    signal: SignalResponder,
    factory: Arc<dyn PeerConnectionFactory>,
    config: TunnelConfig,
) -> Result<ConnectionListener, ConnectError> {
    let (pings_tx, mut pings) = mpsc::unbounded_channel();
    signal.listen(pings_tx).await?;
    tracing::info!(target = "rtc_tunnel::connection", id = %signal.id(), "listening for connections");

    let (connections_tx, connections) = mpsc::unbounded_channel();
    let task = {
        let signal = signal.clone();
        tokio::spawn(async move {
            while let Some(ping) = pings.recv().await {
                let signal = signal.clone();
                let factory = Arc::clone(&factory);
                let config = config.clone();
                let connections = connections_tx.clone();
                tokio::spawn(async move {
                    let remote_id = ping.source_id.clone();
                    match answer(ping, signal, factory, config).await {
                        Ok(connection) => {
                            let _ = connections.send(connection);
                        }
                        Err(err) => tracing::warn!(
                            target = "rtc_tunnel::connection",
                            remote_id = %remote_id,
                            error = %err,
                            "failed to accept connection"
                        ),
                    }
                });
            }
        })
    };

    Ok(ConnectionListener {
        signal,
        connections,
        task,
    })
}

async fn answer(
    ping: PingMessage,
    signal: SignalResponder,
    factory: Arc<dyn PeerConnectionFactory>,
    config: TunnelConfig,
) -> Result<Connection, ConnectError> {
    let remote_id = ping.source_id.clone();
    let peer = factory.create_peer_connection(&config.ice_servers).await?;
    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    let listener = signal.add_ice_candidate_listener(&remote_id, remote_tx);

    let result = respond(&ping, &signal, Arc::clone(&peer), remote_rx, &config).await;
    match result {
        Ok(mut parts) => {
            let signal = signal.clone();
            parts.release = Some(Box::new(move || {
                signal.remove_ice_candidate_listener(&remote_id, listener);
            }));
            Ok(assemble(parts))
        }
        Err(err) => {
            signal.remove_ice_candidate_listener(&remote_id, listener);
            let _ = peer.close().await;
            Err(err)
        }
    }
}

async fn respond(
    ping: &PingMessage,
    signal: &SignalResponder,
    peer: Arc<dyn PeerConnection>,
    remote_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    config: &TunnelConfig,
) -> Result<Parts, ConnectError> {
    let remote_id = ping.source_id.clone();
    let events = take_peer_events(peer.as_ref())?;
    let state = Arc::new(watch::channel(EstablishmentState::Idle).0);
    let Spawned {
        handle: driver,
        mut incoming,
    } = driver::spawn(
        remote_id.clone(),
        Arc::clone(&peer),
        events,
        remote_candidates,
        Arc::clone(&state),
    );

    state::advance(&state, EstablishmentState::OfferOrAnswerPending);
    driver.apply_remote_description(ping.offer.clone()).await?;
    let answer = peer.create_answer().await?;
    peer.set_local_description(answer.clone()).await?;
    signal.pong(ping, answer).await?;

    let forwarder = {
        let signal = signal.clone();
        let remote = remote_id.clone();
        spawn_candidate_forwarder(remote_id.clone(), move |candidate| {
            let signal = signal.clone();
            let remote = remote.clone();
            async move { signal.send_ice_candidate(&remote, candidate).await }
        })
    };
    driver.forward_candidates(forwarder.sink.clone());

    let (control, parked) =
        await_control(&mut incoming, &state, &config.control_label, &remote_id).await?;
    if !wait_connected(&state).await {
        return Err(ConnectError::ConnectionFailed(remote_id));
    }
    let control_events = wait_open(&control).await?;

    Ok(Parts {
        remote_id,
        config: config.clone(),
        peer,
        control,
        control_events,
        state,
        driver,
        incoming,
        parked,
        tasks: vec![forwarder.task],
        release: None,
    })
}

/// Waits for the remote's control channel, holding back any other channel
/// that shows up first.
async fn await_control(
    incoming: &mut mpsc::UnboundedReceiver<Arc<dyn DataChannel>>,
    state: &watch::Sender<EstablishmentState>,
    control_label: &str,
    remote_id: &str,
) -> Result<(Arc<dyn DataChannel>, Vec<Arc<dyn DataChannel>>), ConnectError> {
    let mut parked = Vec::new();
    let mut watcher = state.subscribe();
    loop {
        tokio::select! {
            channel = incoming.recv() => match channel {
                Some(channel) if channel.label() == control_label => return Ok((channel, parked)),
                Some(channel) => parked.push(channel),
                None => return Err(ConnectError::Closed),
            },
            _ = watcher.wait_for(|state| state.is_terminal()) => {
                return Err(ConnectError::ConnectionFailed(remote_id.to_string()));
            }
        }
    }
}

fn take_peer_events(
    peer: &dyn PeerConnection,
) -> Result<mpsc::UnboundedReceiver<PeerEvent>, EngineError> {
    peer.take_events()
        .ok_or_else(|| EngineError::other("peer connection events already taken"))
}

async fn wait_connected(state: &watch::Sender<EstablishmentState>) -> bool {
    let mut watcher = state.subscribe();
    match watcher
        .wait_for(|state| *state == EstablishmentState::Connected || state.is_terminal())
        .await
    {
        Ok(state) => *state == EstablishmentState::Connected,
        Err(_) => false,
    }
}

/// Resolves with the channel's event stream once it is open.
pub(crate) async fn wait_open(
    channel: &Arc<dyn DataChannel>,
) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, ConnectError> {
    let label = channel.label().to_string();
    let mut events = channel
        .take_events()
        .ok_or_else(|| ConnectError::ChannelClosedBeforeOpen(label.clone()))?;
    if channel.ready_state() == ChannelState::Open {
        return Ok(events);
    }
    loop {
        match events.recv().await {
            Some(ChannelEvent::Open) => return Ok(events),
            Some(ChannelEvent::Close) | None => {
                return Err(ConnectError::ChannelClosedBeforeOpen(label));
            }
            Some(ChannelEvent::Error(reason)) => tracing::warn!(
                target = "rtc_tunnel::connection",
                label = %label,
                error = %reason,
                "channel error before open"
            ),
            Some(ChannelEvent::Message { .. }) => tracing::debug!(
                target = "rtc_tunnel::connection",
                label = %label,
                "dropping message received before open"
            ),
        }
    }
}

struct Forwarder {
    sink: mpsc::UnboundedSender<IceCandidate>,
    task: JoinHandle<()>,
}

fn spawn_candidate_forwarder<F, Fut>(remote_id: String, send: F) -> Forwarder
where
    F: Fn(IceCandidate) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), SignalError>> + Send + 'static,
{
    let (sink, mut candidates) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(candidate) = candidates.recv().await {
            match send(candidate).await {
                Ok(()) => {}
                Err(SignalError::Closed) => break,
                Err(err) => tracing::warn!(
                    target = "rtc_tunnel::connection",
                    remote_id = %remote_id,
                    error = %err,
                    "failed to send local candidate"
                ),
            }
        }
    });
    Forwarder { sink, task }
}

type Release = Box<dyn FnOnce() + Send>;

struct Parts {
    remote_id: String,
    config: TunnelConfig,
    peer: Arc<dyn PeerConnection>,
    control: Arc<dyn DataChannel>,
    control_events: mpsc::UnboundedReceiver<ChannelEvent>,
    state: Arc<watch::Sender<EstablishmentState>>,
    driver: DriverHandle,
    incoming: mpsc::UnboundedReceiver<Arc<dyn DataChannel>>,
    parked: Vec<Arc<dyn DataChannel>>,
    tasks: Vec<JoinHandle<()>>,
    release: Option<Release>,
}

fn assemble(parts: Parts) -> Connection {
    let Parts {
        remote_id,
        config,
        peer,
        control,
        control_events,
        state,
        driver,
        incoming,
        parked,
        mut tasks,
        release,
    } = parts;

    let dispatcher = Dispatcher::spawn(Arc::clone(&control), config.dispatcher.clone());
    let (streams_tx, streams) = mpsc::unbounded_channel();
    tasks.push(tokio::spawn(read_control(
        remote_id.clone(),
        control_events,
        dispatcher.clone(),
        Arc::clone(&state),
    )));
    tasks.push(tokio::spawn(accept_channels(
        parked,
        incoming,
        dispatcher.clone(),
        config.stream.clone(),
        streams_tx,
    )));

    let inner = Arc::new(ConnectionInner {
        remote_id,
        config,
        peer,
        dispatcher,
        state,
        streams: tokio::sync::Mutex::new(streams),
        _driver: driver,
        _control: control,
        tasks: Mutex::new(tasks),
        release: Mutex::new(release),
        closed: AtomicBool::new(false),
    });
    let watcher = tokio::spawn(shutdown_when_terminal(
        Arc::downgrade(&inner),
        inner.state.subscribe(),
    ));
    inner.tasks.lock().push(watcher);

    tracing::info!(
        target = "rtc_tunnel::connection",
        remote_id = %inner.remote_id,
        "connection established"
    );
    Connection { inner }
}

async fn read_control(
    remote_id: String,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    dispatcher: Dispatcher,
    state: Arc<watch::Sender<EstablishmentState>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message { data, .. } => match ControlMessage::decode(&data) {
                Ok(message) => dispatcher.control_received(message),
                Err(err) => tracing::warn!(
                    target = "rtc_tunnel::connection",
                    remote_id = %remote_id,
                    error = %err,
                    "malformed control frame"
                ),
            },
            ChannelEvent::Error(reason) => tracing::warn!(
                target = "rtc_tunnel::connection",
                remote_id = %remote_id,
                error = %reason,
                "control channel error"
            ),
            ChannelEvent::Open => {}
            ChannelEvent::Close => break,
        }
    }
    tracing::debug!(target = "rtc_tunnel::connection", remote_id = %remote_id, "control channel closed");
    state::advance(&state, EstablishmentState::Closed);
}

async fn accept_channels(
    parked: Vec<Arc<dyn DataChannel>>,
    mut incoming: mpsc::UnboundedReceiver<Arc<dyn DataChannel>>,
    dispatcher: Dispatcher,
    config: StreamConfig,
    streams: mpsc::UnboundedSender<ChannelStream>,
) {
    let open = |channel: Arc<dyn DataChannel>| {
        let dispatcher = dispatcher.clone();
        let config = config.clone();
        let streams = streams.clone();
        tokio::spawn(async move {
            match wait_open(&channel).await {
                Ok(events) => {
                    if let Err(err) = dispatcher.add_channel(Arc::clone(&channel)).await {
                        tracing::warn!(
                            target = "rtc_tunnel::connection",
                            label = %channel.label(),
                            error = %err,
                            "refusing incoming channel"
                        );
                        let _ = channel.close().await;
                        return;
                    }
                    let stream = ChannelStream::spawn(channel, events, dispatcher, &config);
                    let _ = streams.send(stream);
                }
                Err(err) => tracing::debug!(
                    target = "rtc_tunnel::connection",
                    label = %channel.label(),
                    error = %err,
                    "incoming channel never opened"
                ),
            }
        });
    };
    for channel in parked {
        open(channel);
    }
    while let Some(channel) = incoming.recv().await {
        open(channel);
    }
}

async fn shutdown_when_terminal(
    inner: Weak<ConnectionInner>,
    mut state: watch::Receiver<EstablishmentState>,
) {
    let _ = state.wait_for(|state| state.is_terminal()).await;
    if let Some(inner) = inner.upgrade() {
        inner.shutdown().await;
    }
}

struct ConnectionInner {
    remote_id: String,
    config: TunnelConfig,
    peer: Arc<dyn PeerConnection>,
    dispatcher: Dispatcher,
    state: Arc<watch::Sender<EstablishmentState>>,
    streams: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelStream>>,
    _driver: DriverHandle,
    _control: Arc<dyn DataChannel>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    release: Mutex<Option<Release>>,
    closed: AtomicBool,
}

impl ConnectionInner {
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        state::advance(&self.state, EstablishmentState::Closed);
        tracing::info!(
            target = "rtc_tunnel::connection",
            remote_id = %self.remote_id,
            "connection closed"
        );
        self.dispatcher.shutdown();
        if let Err(err) = self.peer.close().await {
            tracing::warn!(
                target = "rtc_tunnel::connection",
                remote_id = %self.remote_id,
                error = %err,
                "failed to close peer connection"
            );
        }
        if let Some(release) = self.release.lock().take() {
            release();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.shutdown();
        if let Some(release) = self.release.get_mut().take() {
            release();
        }
        let peer = Arc::clone(&self.peer);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = peer.close().await;
            });
        }
    }
}

/// An established tunnel to one remote peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn remote_id(&self) -> &str {
        &self.inner.remote_id
    }

    pub fn state(&self) -> EstablishmentState {
        *self.inner.state.borrow()
    }

    /// Opens a new stream labeled `label`; resolves once the channel is open.
    /// A label stays taken until the stream using it has closed.
    pub async fn create_stream(&self, label: &str) -> Result<ChannelStream, ConnectError> {
        if label == self.inner.config.control_label {
            return Err(ConnectError::ReservedLabel(label.to_string()));
        }
        if self.state().is_terminal() {
            return Err(ConnectError::Closed);
        }
        if self.inner.dispatcher.has_channel(label).await {
            return Err(ConnectError::LabelInUse(label.to_string()));
        }
        let channel = self.inner.peer.create_data_channel(label).await?;
        let events = wait_open(&channel).await?;
        match self.inner.dispatcher.add_channel(Arc::clone(&channel)).await {
            Ok(()) => {}
            Err(err) => {
                // Lost a race with another stream taking the label.
                let _ = channel.close().await;
                return Err(match err {
                    DispatchError::LabelInUse(label) => ConnectError::LabelInUse(label),
                    _ => ConnectError::Closed,
                });
            }
        }
        tracing::debug!(
            target = "rtc_tunnel::connection",
            remote_id = %self.inner.remote_id,
            label,
            "stream opened"
        );
        Ok(ChannelStream::spawn(
            channel,
            events,
            self.inner.dispatcher.clone(),
            &self.inner.config.stream,
        ))
    }

    /// Next stream opened by the remote side; `None` once the connection is
    /// closed.
    pub async fn accept_stream(&self) -> Option<ChannelStream> {
        self.inner.streams.lock().await.recv().await
    }

    /// Resolves once the connection has closed, from either side.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| state.is_terminal()).await;
    }

    pub async fn close(&self) {
        self.inner.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_id", &self.inner.remote_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Connections accepted by [`listen`].
pub struct ConnectionListener {
    signal: SignalResponder,
    connections: mpsc::UnboundedReceiver<Connection>,
    task: JoinHandle<()>,
}

impl ConnectionListener {
    pub fn id(&self) -> &str {
        self.signal.id()
    }

    /// Next established connection; `None` after [`close`](Self::close).
    pub async fn accept(&mut self) -> Option<Connection> {
        self.connections.recv().await
    }

    /// Stops answering pings. Established connections stay up.
    pub fn close(&self) {
        self.task.abort();
        self.signal.close();
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.close();
    }
}
