//! Serializes sends from every logical channel of one connection onto the
//! shared transport.
//!
//! A single task owns all per-channel queues. Each round it flushes pending
//! control frames, then picks the eligible channel with the smallest outbound
//! buffer (ties go to the channel registered first) and sends its oldest
//! payload once that buffer is below the high-water mark. Channels the remote
//! reported `full` are skipped until it reports `empty`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::DispatcherConfig;
use crate::engine::{ChannelState, DataChannel};

pub mod control;

pub use control::{ControlKind, ControlMessage};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("channel {0} is closed")]
    ChannelClosed(String),
    #[error("send on channel {label} failed: {reason}")]
    ChannelSendError { label: String, reason: String },
    #[error("label {0} is already registered")]
    LabelInUse(String),
}

type Reply = oneshot::Sender<Result<(), DispatchError>>;

enum Command {
    AddChannel {
        channel: Arc<dyn DataChannel>,
        done: Reply,
    },
    RemoveChannel(Arc<dyn DataChannel>),
    HasChannel {
        label: String,
        reply: oneshot::Sender<bool>,
    },
    Send {
        label: String,
        payload: Bytes,
        done: Reply,
    },
    SendControl(ControlMessage),
    ControlReceived(ControlMessage),
    Shutdown,
}

/// Outcome of a queued dispatcher command. For sends it resolves once the
/// payload was handed to the transport, or with the reason it never will be.
/// The command is queued even if this is dropped unpolled.
#[derive(Debug)]
pub struct Completion {
    label: String,
    rx: oneshot::Receiver<Result<(), DispatchError>>,
}

impl Future for Completion {
    type Output = Result<(), DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DispatchError::ChannelClosed(self.label.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle to a connection's dispatcher task.
#[derive(Clone)]
pub struct Dispatcher {
    commands: mpsc::UnboundedSender<Command>,
}

impl Dispatcher {
    pub fn spawn(control: Arc<dyn DataChannel>, config: DispatcherConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = DispatcherTask {
            control,
            config,
            commands: rx,
            control_queue: VecDeque::new(),
            queues: Vec::new(),
        };
        tokio::spawn(task.run());
        Self { commands }
    }

    /// Registers `channel` under its label. Fails with `LabelInUse` while
    /// another channel holds that label.
    pub fn add_channel(&self, channel: Arc<dyn DataChannel>) -> Completion {
        let (done, rx) = oneshot::channel();
        let label = channel.label().to_string();
        let _ = self.commands.send(Command::AddChannel { channel, done });
        Completion { label, rx }
    }

    /// Drops the queue of `channel`, rejecting its pending sends. A different
    /// channel registered under the same label is left alone.
    pub fn remove_channel(&self, channel: Arc<dyn DataChannel>) {
        let _ = self.commands.send(Command::RemoveChannel(channel));
    }

    pub async fn has_channel(&self, label: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::HasChannel {
            label: label.to_string(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Enqueues `payload` behind earlier sends on the same channel.
    pub fn send(&self, label: &str, payload: Bytes) -> Completion {
        let (done, rx) = oneshot::channel();
        // A stopped dispatcher drops `done`, which resolves as ChannelClosed.
        let _ = self.commands.send(Command::Send {
            label: label.to_string(),
            payload,
            done,
        });
        Completion {
            label: label.to_string(),
            rx,
        }
    }

    pub fn send_control(&self, label: &str, kind: ControlKind) {
        let _ = self
            .commands
            .send(Command::SendControl(ControlMessage::new(kind, label)));
    }

    pub fn control_received(&self, message: ControlMessage) {
        let _ = self.commands.send(Command::ControlReceived(message));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

struct PendingSend {
    payload: Bytes,
    done: Reply,
}

struct ChannelQueue {
    label: String,
    channel: Arc<dyn DataChannel>,
    pending: VecDeque<PendingSend>,
    remote_full: bool,
}

impl ChannelQueue {
    fn reject_all(&mut self) {
        for pending in self.pending.drain(..) {
            let _ = pending
                .done
                .send(Err(DispatchError::ChannelClosed(self.label.clone())));
        }
    }
}

fn same_channel(a: &Arc<dyn DataChannel>, b: &Arc<dyn DataChannel>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct DispatcherTask {
    control: Arc<dyn DataChannel>,
    config: DispatcherConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    control_queue: VecDeque<ControlMessage>,
    // Registration order doubles as the tie-break order.
    queues: Vec<ChannelQueue>,
}

impl DispatcherTask {
    async fn run(mut self) {
        self.control
            .set_buffered_amount_low_threshold(self.config.high_water_mark)
            .await;
        loop {
            while let Ok(command) = self.commands.try_recv() {
                if !self.apply(command).await {
                    return;
                }
            }

            let woken_by = if !self.control_queue.is_empty() {
                self.flush_control().await;
                if self.control_queue.is_empty() {
                    continue;
                }
                let control = Arc::clone(&self.control);
                self.wait_drain(&control).await
            } else {
                match self.next_candidate().await {
                    None => Some(self.commands.recv().await),
                    Some((index, buffered)) if buffered < self.config.high_water_mark => {
                        self.send_front(index).await;
                        None
                    }
                    Some((index, buffered)) => {
                        let channel = Arc::clone(&self.queues[index].channel);
                        tracing::trace!(
                            target = "rtc_tunnel::dispatcher",
                            label = %channel.label(),
                            buffered_amount = buffered,
                            "waiting for outbound buffer to drain"
                        );
                        self.wait_drain(&channel).await
                    }
                }
            };

            match woken_by {
                Some(Some(command)) => {
                    if !self.apply(command).await {
                        return;
                    }
                }
                Some(None) => {
                    self.stop();
                    return;
                }
                None => {}
            }
        }
    }

    /// Returns false once the dispatcher should stop.
    async fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::AddChannel { channel, done } => {
                let label = channel.label().to_string();
                if self.position(&label).is_some() {
                    tracing::warn!(
                        target = "rtc_tunnel::dispatcher",
                        label = %label,
                        "label already registered"
                    );
                    let _ = done.send(Err(DispatchError::LabelInUse(label)));
                    return true;
                }
                channel
                    .set_buffered_amount_low_threshold(self.config.high_water_mark)
                    .await;
                tracing::debug!(target = "rtc_tunnel::dispatcher", label = %label, "channel added");
                self.queues.push(ChannelQueue {
                    label,
                    channel,
                    pending: VecDeque::new(),
                    remote_full: false,
                });
                let _ = done.send(Ok(()));
            }
            Command::RemoveChannel(channel) => {
                let found = self
                    .queues
                    .iter()
                    .position(|queue| same_channel(&queue.channel, &channel));
                if let Some(index) = found {
                    let mut queue = self.queues.remove(index);
                    tracing::debug!(
                        target = "rtc_tunnel::dispatcher",
                        label = %queue.label,
                        pending = queue.pending.len(),
                        "channel removed"
                    );
                    queue.reject_all();
                }
            }
            Command::HasChannel { label, reply } => {
                let _ = reply.send(self.position(&label).is_some());
            }
            Command::Send {
                label,
                payload,
                done,
            } => match self.position(&label) {
                Some(index) => self.queues[index]
                    .pending
                    .push_back(PendingSend { payload, done }),
                None => {
                    let _ = done.send(Err(DispatchError::ChannelClosed(label)));
                }
            },
            Command::SendControl(message) => self.control_queue.push_back(message),
            Command::ControlReceived(message) => match self.position(&message.label) {
                Some(index) => {
                    tracing::debug!(
                        target = "rtc_tunnel::dispatcher",
                        label = %message.label,
                        kind = ?message.kind,
                        "remote flow control"
                    );
                    self.queues[index].remote_full = message.kind == ControlKind::Full;
                }
                None => tracing::debug!(
                    target = "rtc_tunnel::dispatcher",
                    label = %message.label,
                    "flow control for unknown channel"
                ),
            },
            Command::Shutdown => {
                self.stop();
                return false;
            }
        }
        true
    }

    fn position(&self, label: &str) -> Option<usize> {
        self.queues.iter().position(|queue| queue.label == label)
    }

    async fn next_candidate(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for (index, queue) in self.queues.iter().enumerate() {
            if queue.remote_full || queue.pending.is_empty() {
                continue;
            }
            let buffered = queue.channel.buffered_amount().await;
            if best.is_none_or(|(_, lowest)| buffered < lowest) {
                best = Some((index, buffered));
            }
        }
        best
    }

    async fn send_front(&mut self, index: usize) {
        let queue = &mut self.queues[index];
        let Some(pending) = queue.pending.pop_front() else {
            return;
        };
        let label = queue.label.clone();
        let channel = Arc::clone(&queue.channel);

        let result = if channel.ready_state() != ChannelState::Open {
            Err(DispatchError::ChannelSendError {
                label,
                reason: "channel is not open".to_string(),
            })
        } else {
            match channel.send(pending.payload).await {
                Ok(_) => Ok(()),
                Err(err) => Err(DispatchError::ChannelSendError {
                    label,
                    reason: err.to_string(),
                }),
            }
        };
        if let Err(err) = &result {
            tracing::warn!(target = "rtc_tunnel::dispatcher", error = %err, "send failed");
        }
        let _ = pending.done.send(result);
    }

    /// Waits for `channel` to report a low buffer, the poll interval, or the
    /// next command, whichever comes first. Returns the command if one woke it.
    async fn wait_drain(&mut self, channel: &Arc<dyn DataChannel>) -> Option<Option<Command>> {
        let low = channel.buffered_amount_low();
        tokio::select! {
            _ = low.notified() => None,
            _ = tokio::time::sleep(self.config.poll_interval) => None,
            command = self.commands.recv() => Some(command),
        }
    }

    /// Sends queued control frames until the queue is empty or the control
    /// channel's own buffer reaches the high-water mark.
    async fn flush_control(&mut self) {
        while !self.control_queue.is_empty() {
            let open = self.control.ready_state() == ChannelState::Open;
            if open {
                let buffered = self.control.buffered_amount().await;
                if buffered >= self.config.high_water_mark {
                    tracing::trace!(
                        target = "rtc_tunnel::dispatcher",
                        buffered_amount = buffered,
                        "waiting for control buffer to drain"
                    );
                    return;
                }
            }
            let Some(message) = self.control_queue.pop_front() else {
                return;
            };
            if !open {
                tracing::debug!(
                    target = "rtc_tunnel::dispatcher",
                    label = %message.label,
                    "control channel not open; dropping control frame"
                );
                continue;
            }
            let text = match message.encode() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(target = "rtc_tunnel::dispatcher", error = %err, "failed to encode control frame");
                    continue;
                }
            };
            if let Err(err) = self.control.send_text(text).await {
                tracing::warn!(target = "rtc_tunnel::dispatcher", error = %err, "control send failed");
            }
        }
    }

    fn stop(&mut self) {
        for queue in &mut self.queues {
            queue.reject_all();
        }
        self.queues.clear();
        self.control_queue.clear();
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send { label, done, .. } => {
                    let _ = done.send(Err(DispatchError::ChannelClosed(label)));
                }
                Command::AddChannel { channel, done } => {
                    let label = channel.label().to_string();
                    let _ = done.send(Err(DispatchError::ChannelClosed(label)));
                }
                _ => {}
            }
        }
        tracing::debug!(target = "rtc_tunnel::dispatcher", "dispatcher stopped");
    }
}
