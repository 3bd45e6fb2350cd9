//! Scriptable [`DataChannel`] that records what is sent through it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use super::{ChannelEvent, ChannelState, DataChannel, EngineError};

/// Shared record of `"<label>:<payload>"` entries, in send order.
pub(crate) type Log = Arc<Mutex<Vec<String>>>;

pub(crate) fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) struct FakeChannel {
    label: String,
    state: Mutex<ChannelState>,
    buffered: AtomicUsize,
    low: Arc<Notify>,
    fail_next: AtomicBool,
    events: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    log: Log,
}

impl FakeChannel {
    pub(crate) fn new(label: &str, log: &Log) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Open),
            buffered: AtomicUsize::new(0),
            low: Arc::new(Notify::new()),
            fail_next: AtomicBool::new(false),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            log: Arc::clone(log),
        })
    }

    pub(crate) fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    pub(crate) fn notify_low(&self) {
        self.low.notify_one();
    }

    pub(crate) fn fail_next_send(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Injects an event as if the engine had raised it.
    pub(crate) fn emit(&self, event: ChannelEvent) {
        if event == ChannelEvent::Close {
            *self.state.lock() = ChannelState::Closed;
        }
        let _ = self.events.send(event);
    }

    fn record(&self, payload: &[u8]) {
        self.log
            .lock()
            .push(format!("{}:{}", self.label, String::from_utf8_lossy(payload)));
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}

    fn buffered_amount_low(&self) -> Arc<Notify> {
        Arc::clone(&self.low)
    }

    async fn send(&self, data: Bytes) -> Result<usize, EngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Other("wire cut".into()));
        }
        self.record(&data);
        Ok(data.len())
    }

    async fn send_text(&self, text: String) -> Result<usize, EngineError> {
        self.record(text.as_bytes());
        Ok(text.len())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), EngineError> {
        let previous = std::mem::replace(&mut *self.state.lock(), ChannelState::Closed);
        if previous != ChannelState::Closed {
            self.log.lock().push(format!("{}:<closed>", self.label));
            let _ = self.events.send(ChannelEvent::Close);
        }
        Ok(())
    }
}
