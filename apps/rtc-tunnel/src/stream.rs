//! Byte-stream view over one labeled data channel.
//!
//! Writes go through the connection's [`Dispatcher`]. The byte-stream writer
//! keeps one chunk in flight: `poll_write` accepts a chunk once the previous
//! one has reached the transport, and a failed chunk surfaces on the next
//! write, flush or shutdown.
//! Inbound payloads land in a local buffer owned by a pump task, which feeds a
//! bounded intake the reader consumes from. When the intake fills, the pump
//! tells the remote sender `full`; once the buffer drains again it sends
//! `empty`.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::StreamConfig;
use crate::dispatcher::{Completion, ControlKind, DispatchError, Dispatcher};
use crate::engine::{ChannelEvent, DataChannel, EngineError};

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("channel {label} reported an error: {reason}")]
    Channel { label: String, reason: String },
    #[error("closing channel {label} failed: {reason}")]
    Close { label: String, reason: String },
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::Dispatch(DispatchError::ChannelClosed(_)) => io::ErrorKind::BrokenPipe,
            StreamError::Dispatch(DispatchError::ChannelSendError { .. }) => {
                io::ErrorKind::ConnectionReset
            }
            StreamError::Channel { .. } | StreamError::Close { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

type Inbound = Result<Bytes, StreamError>;
type CloseFuture = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>>;

pub struct ChannelStream {
    label: String,
    channel: Arc<dyn DataChannel>,
    dispatcher: Dispatcher,
    max_chunk: usize,
    intake: mpsc::Receiver<Inbound>,
    pending_read: Bytes,
    eof: bool,
    in_flight: Option<Completion>,
    closing: Option<CloseFuture>,
    closed: bool,
}

impl ChannelStream {
    /// Wraps an open channel already registered with `dispatcher`. `events`
    /// must be the channel's event stream.
    pub(crate) fn spawn(
        channel: Arc<dyn DataChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        dispatcher: Dispatcher,
        config: &StreamConfig,
    ) -> Self {
        let label = channel.label().to_string();
        let (intake_tx, intake) = mpsc::channel(config.read_capacity.max(1));
        tokio::spawn(
            Pump {
                label: label.clone(),
                channel: Arc::clone(&channel),
                dispatcher: dispatcher.clone(),
                intake: intake_tx,
                buffer: VecDeque::new(),
                local_full: false,
            }
            .run(events),
        );
        Self {
            label,
            channel,
            dispatcher,
            max_chunk: config.max_chunk.max(1),
            intake,
            pending_read: Bytes::new(),
            eof: false,
            in_flight: None,
            closing: None,
            closed: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sends one payload as a single message, bypassing chunking. The payload
    /// is queued before this returns; the future tracks its completion.
    pub fn write_payload(
        &self,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), StreamError>> + Send + use<> {
        let completion = self.dispatcher.send(&self.label, payload);
        async move {
            completion.await?;
            Ok(())
        }
    }

    /// Next inbound payload as it arrived; `None` once the channel closed.
    pub async fn read_payload(&mut self) -> Option<Result<Bytes, StreamError>> {
        if !self.pending_read.is_empty() {
            return Some(Ok(std::mem::take(&mut self.pending_read)));
        }
        if self.eof {
            return None;
        }
        let next = self.intake.recv().await;
        if next.is_none() {
            self.eof = true;
        }
        next
    }

    /// Closes the underlying channel. There is no half-close.
    pub async fn close(mut self) -> Result<(), StreamError> {
        self.closed = true;
        self.channel
            .close()
            .await
            .map_err(|err| StreamError::Close {
                label: self.label.clone(),
                reason: err.to_string(),
            })
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(completion) = self.in_flight.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(completion).poll(cx));
        self.in_flight = None;
        Poll::Ready(result.map_err(|err| StreamError::from(err).into()))
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending_read.is_empty() {
                let n = this.pending_read.len().min(buf.remaining());
                buf.put_slice(&this.pending_read.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.intake.poll_recv(cx)) {
                Some(Ok(payload)) => this.pending_read = payload,
                Some(Err(err)) => return Poll::Ready(Err(err.into())),
                None => this.eof = true,
            }
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // Nothing from `data` is taken until the previous chunk is through, so
        // a caller may abandon this write and retry with any buffer.
        ready!(this.poll_in_flight(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let len = data.len().min(this.max_chunk);
        this.in_flight = Some(
            this.dispatcher
                .send(&this.label, Bytes::copy_from_slice(&data[..len])),
        );
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;
        if this.closing.is_none() {
            if this.closed {
                return Poll::Ready(Ok(()));
            }
            let channel = Arc::clone(&this.channel);
            this.closing = Some(Box::pin(async move { channel.close().await }));
        }
        let result = match this.closing.as_mut() {
            Some(closing) => ready!(closing.as_mut().poll(cx)),
            None => Ok(()),
        };
        this.closing = None;
        this.closed = true;
        Poll::Ready(result.map_err(|err| {
            StreamError::Close {
                label: this.label.clone(),
                reason: err.to_string(),
            }
            .into()
        }))
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let channel = Arc::clone(&self.channel);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = channel.close().await;
            });
        }
    }
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("label", &self.label)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

struct Pump {
    label: String,
    channel: Arc<dyn DataChannel>,
    dispatcher: Dispatcher,
    intake: mpsc::Sender<Inbound>,
    buffer: VecDeque<Inbound>,
    local_full: bool,
}

impl Pump {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let mut remote_closed = false;
        loop {
            if !self.drain() {
                tracing::debug!(
                    target = "rtc_tunnel::stream",
                    label = %self.label,
                    "reader dropped; closing channel"
                );
                let _ = self.channel.close().await;
                break;
            }
            if remote_closed && self.buffer.is_empty() {
                break;
            }

            tokio::select! {
                event = events.recv(), if !remote_closed => match event {
                    Some(ChannelEvent::Message { data, .. }) => self.buffer.push_back(Ok(data)),
                    Some(ChannelEvent::Error(reason)) => {
                        tracing::warn!(
                            target = "rtc_tunnel::stream",
                            label = %self.label,
                            error = %reason,
                            "channel error"
                        );
                        self.buffer.push_back(Err(StreamError::Channel {
                            label: self.label.clone(),
                            reason,
                        }));
                    }
                    Some(ChannelEvent::Open) => {}
                    Some(ChannelEvent::Close) | None => remote_closed = true,
                },
                permit = self.intake.reserve(), if !self.buffer.is_empty() => match (permit, self.buffer.pop_front()) {
                    (Ok(permit), Some(item)) => permit.send(item),
                    (Ok(_), None) => {}
                    (Err(_), _) => self.buffer.clear(),
                },
                _ = self.intake.closed(), if self.buffer.is_empty() && !remote_closed => {}
            }
        }
        tracing::debug!(target = "rtc_tunnel::stream", label = %self.label, "stream finished");
        self.dispatcher.remove_channel(Arc::clone(&self.channel));
    }

    /// Moves buffered payloads into the intake until it fills. Returns false
    /// once the reader is gone.
    fn drain(&mut self) -> bool {
        while let Some(item) = self.buffer.pop_front() {
            match self.intake.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    self.buffer.push_front(item);
                    if !self.local_full {
                        self.local_full = true;
                        tracing::trace!(target = "rtc_tunnel::stream", label = %self.label, "intake full");
                        self.dispatcher.send_control(&self.label, ControlKind::Full);
                    }
                    return true;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        if self.intake.is_closed() {
            return false;
        }
        if self.local_full {
            self.local_full = false;
            tracing::trace!(target = "rtc_tunnel::stream", label = %self.label, "intake drained");
            self.dispatcher.send_control(&self.label, ControlKind::Empty);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::engine::fake::{self, FakeChannel, Log};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Fixture {
        log: Log,
        channel: Arc<FakeChannel>,
        stream: ChannelStream,
    }

    fn fixture(read_capacity: usize, max_chunk: usize) -> Fixture {
        let log = fake::log();
        let dispatcher = Dispatcher::spawn(
            FakeChannel::new("control", &log),
            DispatcherConfig {
                high_water_mark: 1 << 20,
                poll_interval: Duration::from_millis(20),
            },
        );
        let channel = FakeChannel::new("s1", &log);
        dispatcher.add_channel(channel.clone());
        let events = channel.take_events().expect("events");
        let stream = ChannelStream::spawn(
            channel.clone(),
            events,
            dispatcher,
            &StreamConfig {
                read_capacity,
                max_chunk,
            },
        );
        Fixture {
            log,
            channel,
            stream,
        }
    }

    fn message(text: &str) -> ChannelEvent {
        ChannelEvent::Message {
            data: Bytes::copy_from_slice(text.as_bytes()),
            is_string: false,
        }
    }

    fn controls(log: &Log) -> Vec<String> {
        log.lock()
            .iter()
            .filter(|entry| entry.starts_with("control:"))
            .cloned()
            .collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn writes_are_chunked_through_the_dispatcher() {
        let mut fixture = fixture(4, 4);
        fixture.stream.write_all(b"abcdefghij").await.expect("write");
        fixture.stream.flush().await.expect("flush");
        assert_eq!(
            *fixture.log.lock(),
            vec!["s1:abcd", "s1:efgh", "s1:ij"]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_event_ends_the_stream_after_buffered_data() {
        let mut fixture = fixture(4, 1024);
        fixture.channel.emit(message("hel"));
        fixture.channel.emit(message("lo"));
        fixture.channel.emit(ChannelEvent::Close);

        let mut received = String::new();
        fixture
            .stream
            .read_to_string(&mut received)
            .await
            .expect("read");
        assert_eq!(received, "hello");
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_and_empty_are_sent_once_per_transition() {
        let mut fixture = fixture(2, 1024);
        for i in 0..6 {
            fixture.channel.emit(message(&i.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            controls(&fixture.log),
            vec![r#"control:{"type":"full","label":"s1"}"#]
        );

        for i in 0..6 {
            let payload = fixture
                .stream
                .read_payload()
                .await
                .expect("payload")
                .expect("ok");
            assert_eq!(payload, i.to_string().as_bytes());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            controls(&fixture.log),
            vec![
                r#"control:{"type":"full","label":"s1"}"#,
                r#"control:{"type":"empty","label":"s1"}"#,
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn channel_errors_surface_to_the_reader() {
        let mut fixture = fixture(4, 1024);
        fixture
            .channel
            .emit(ChannelEvent::Error("sctp abort".into()));
        let mut buf = [0u8; 8];
        let err = fixture.stream.read(&mut buf).await.expect_err("error");
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_closes_the_channel() {
        let mut fixture = fixture(4, 1024);
        fixture.stream.shutdown().await.expect("shutdown");
        assert!(fixture.log.lock().contains(&"s1:<closed>".to_string()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn writes_after_channel_removal_fail() {
        let mut fixture = fixture(4, 1024);
        fixture.channel.emit(ChannelEvent::Close);
        let mut buf = [0u8; 1];
        assert_eq!(fixture.stream.read(&mut buf).await.expect("eof"), 0);
        // The pump deregisters the channel once it saw the close.
        tokio::time::sleep(Duration::from_millis(20)).await;
        fixture.stream.write_all(b"late").await.expect("accepted");
        let err = fixture.stream.flush().await.expect_err("closed");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test_timeout::tokio_timeout_test]
    async fn abandoned_write_takes_nothing_from_its_buffer() {
        let mut fixture = fixture(4, 1024);
        fixture.channel.set_buffered(2 << 20);
        assert_eq!(fixture.stream.write(b"abc").await.expect("queued"), 3);

        // The first chunk is stuck behind the high-water mark, so this write
        // waits and is then dropped.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), fixture.stream.write(b"0123456789"))
                .await;
        assert!(abandoned.is_err());

        fixture.channel.set_buffered(0);
        fixture.channel.notify_low();
        assert_eq!(fixture.stream.write(b"xy").await.expect("retried"), 2);
        fixture.stream.flush().await.expect("flush");
        assert_eq!(*fixture.log.lock(), vec!["s1:abc", "s1:xy"]);
    }
}
