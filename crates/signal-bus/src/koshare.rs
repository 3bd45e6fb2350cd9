//! Websocket client for a koshare router.
//!
//! Frames are JSON objects `{type, topic, id?, body?, dst?, src?}`. Topics are
//! namespaced by an optional prefix that is stripped again on delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use crate::{deliver, Bus, BusAddress, BusError, BusPacket, BusResult, PacketKind, Subscription};

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Error = 0,
    Echo = 1,
    Subscribe = 2,
    Unsubscribe = 3,
    Message = 4,
    Info = 5,
    Broadcast = 6,
    Hello = 7,
}

impl PacketType {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Error,
            1 => Self::Echo,
            2 => Self::Subscribe,
            3 => Self::Unsubscribe,
            4 => Self::Message,
            5 => Self::Info,
            6 => Self::Broadcast,
            7 => Self::Hello,
            _ => return None,
        })
    }
}

#[derive(Debug, Serialize)]
struct OutgoingFrame {
    #[serde(rename = "type")]
    kind: u8,
    topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dst: Option<BusAddress>,
}

#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    src: Option<BusAddress>,
    #[serde(default)]
    error: Option<String>,
}

type OperationResult = Result<(), String>;

struct Shared {
    prefix: String,
    closed: AtomicBool,
    next_operation: AtomicU64,
    operations: Mutex<HashMap<u64, oneshot::Sender<OperationResult>>>,
    handlers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusPacket>>>>,
    last_send: Mutex<Instant>,
}

struct Link {
    outbound: mpsc::UnboundedSender<String>,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    fn shutdown(self) {
        self.alive.store(false, Ordering::Release);
        for task in self.tasks {
            task.abort();
        }
    }
}

pub struct KoshareClient {
    endpoint: Url,
    keep_alive: Duration,
    shared: Arc<Shared>,
    link: AsyncMutex<Option<Link>>,
}

impl KoshareClient {
    pub async fn connect(endpoint: &str, prefix: impl Into<String>) -> BusResult<Self> {
        Self::connect_with_keep_alive(endpoint, prefix, DEFAULT_KEEP_ALIVE).await
    }

    pub async fn connect_with_keep_alive(
        endpoint: &str,
        prefix: impl Into<String>,
        keep_alive: Duration,
    ) -> BusResult<Self> {
        let endpoint = parse_endpoint(endpoint)?;
        let shared = Arc::new(Shared {
            prefix: prefix.into(),
            closed: AtomicBool::new(false),
            next_operation: AtomicU64::new(1),
            operations: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            last_send: Mutex::new(Instant::now()),
        });
        let link = open_link(&endpoint, &shared, keep_alive).await?;
        Ok(Self {
            endpoint,
            keep_alive,
            shared,
            link: AsyncMutex::new(Some(link)),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.shared.prefix
    }

    /// Returns a sender on a live socket, reconnecting and re-subscribing
    /// every known topic if the previous socket went away.
    async fn outbound(&self) -> BusResult<mpsc::UnboundedSender<String>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.is_alive() {
                return Ok(link.outbound.clone());
            }
        }
        if let Some(stale) = guard.take() {
            stale.shutdown();
        }

        tracing::debug!(
            target = "signal_bus::koshare",
            endpoint = %self.endpoint,
            "reconnecting to router"
        );
        let link = open_link(&self.endpoint, &self.shared, self.keep_alive).await?;
        let outbound = link.outbound.clone();
        *guard = Some(link);

        let topics: Vec<String> = self.shared.handlers.lock().keys().cloned().collect();
        for topic in topics {
            let (id, response) = self.shared.register_operation();
            self.shared
                .write(&outbound, PacketType::Subscribe, &topic, Some(id), None, None)?;
            await_operation(&topic, response).await?;
            tracing::debug!(target = "signal_bus::koshare", topic = %topic, "re-subscribed");
        }
        Ok(outbound)
    }

    async fn send(
        &self,
        kind: PacketType,
        topic: &str,
        id: Option<u64>,
        body: Option<Value>,
        dst: Option<BusAddress>,
    ) -> BusResult<()> {
        let outbound = self.outbound().await?;
        self.shared.write(&outbound, kind, topic, id, body, dst)
    }
}

impl Shared {
    fn register_operation(&self) -> (u64, oneshot::Receiver<OperationResult>) {
        let id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.operations.lock().insert(id, tx);
        (id, rx)
    }

    fn write(
        &self,
        outbound: &mpsc::UnboundedSender<String>,
        kind: PacketType,
        topic: &str,
        id: Option<u64>,
        body: Option<Value>,
        dst: Option<BusAddress>,
    ) -> BusResult<()> {
        let frame = OutgoingFrame {
            kind: kind as u8,
            topic: format!("{}{}", self.prefix, topic),
            id,
            body,
            dst,
        };
        let text = serde_json::to_string(&frame)
            .map_err(|err| BusError::Transport(format!("encode frame: {err}")))?;
        tracing::trace!(
            target = "signal_bus::koshare",
            event = "ws_out",
            kind = ?kind,
            topic,
            len = text.len()
        );
        outbound.send(text).map_err(|_| BusError::Closed)?;
        *self.last_send.lock() = Instant::now();
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        let frame: IncomingFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(target = "signal_bus::koshare", error = %err, "malformed frame");
                return;
            }
        };
        let topic = frame
            .topic
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(&frame.topic)
            .to_string();
        match PacketType::from_wire(frame.kind) {
            Some(kind @ (PacketType::Message | PacketType::Broadcast)) => {
                let packet = BusPacket {
                    kind: if kind == PacketType::Message {
                        PacketKind::Message
                    } else {
                        PacketKind::Broadcast
                    },
                    topic: topic.clone(),
                    src: frame.src.unwrap_or_default(),
                    body: frame.body,
                };
                let mut handlers = self.handlers.lock();
                if let Some(senders) = handlers.get_mut(&topic) {
                    deliver(senders, &packet);
                }
            }
            Some(PacketType::Subscribe) => {
                let Some(id) = frame.id else {
                    return;
                };
                if let Some(waiter) = self.operations.lock().remove(&id) {
                    let _ = waiter.send(match frame.error {
                        Some(reason) => Err(reason),
                        None => Ok(()),
                    });
                }
            }
            other => {
                tracing::trace!(target = "signal_bus::koshare", kind = ?other, topic = %topic, "ignored frame");
            }
        }
    }

    fn fail_operations(&self) {
        self.operations.lock().clear();
    }
}

#[async_trait]
impl Bus for KoshareClient {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let (id, response) = self.shared.register_operation();
        self.send(PacketType::Subscribe, topic, Some(id), None, None)
            .await?;
        await_operation(topic, response).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .handlers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> BusResult<()> {
        self.shared.handlers.lock().remove(topic);
        self.send(PacketType::Unsubscribe, topic, None, None, None)
            .await
    }

    async fn broadcast(&self, topic: &str, body: Value) -> BusResult<()> {
        self.send(PacketType::Broadcast, topic, None, Some(body), None)
            .await
    }

    async fn message(&self, topic: &str, destination: BusAddress, body: Value) -> BusResult<()> {
        self.send(
            PacketType::Message,
            topic,
            None,
            Some(body),
            Some(destination),
        )
        .await
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target = "signal_bus::koshare", endpoint = %self.endpoint, "closing");
        if let Ok(mut guard) = self.link.try_lock() {
            if let Some(link) = guard.take() {
                link.shutdown();
            }
        }
        self.shared.handlers.lock().clear();
        self.shared.fail_operations();
    }
}

impl Drop for KoshareClient {
    fn drop(&mut self) {
        self.close();
        if let Some(link) = self.link.get_mut().take() {
            link.shutdown();
        }
    }
}

fn parse_endpoint(endpoint: &str) -> BusResult<Url> {
    let url = Url::parse(endpoint)
        .map_err(|err| BusError::Transport(format!("invalid router url {endpoint}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(BusError::Transport(format!(
            "unsupported router scheme {other}"
        ))),
    }
}

async fn await_operation(
    topic: &str,
    response: oneshot::Receiver<OperationResult>,
) -> BusResult<()> {
    match response.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(BusError::Rejected {
            topic: topic.to_string(),
            reason,
        }),
        Err(_) => Err(BusError::Closed),
    }
}

async fn open_link(endpoint: &Url, shared: &Arc<Shared>, keep_alive: Duration) -> BusResult<Link> {
    let (ws_stream, _) = connect_async(endpoint.as_str())
        .await
        .map_err(|err| BusError::Transport(format!("websocket connect failed: {err}")))?;
    tracing::debug!(
        target = "signal_bus::koshare",
        endpoint = %endpoint,
        "router websocket connected"
    );
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let alive = Arc::new(AtomicBool::new(true));

    let writer_alive = Arc::clone(&alive);
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(err) = ws_write.send(Message::Text(text)).await {
                tracing::debug!(target = "signal_bus::koshare", error = %err, "websocket send failed");
                break;
            }
        }
        writer_alive.store(false, Ordering::Release);
    });

    let reader_alive = Arc::clone(&alive);
    let reader_shared = Arc::clone(shared);
    let reader = tokio::spawn(async move {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Text(text)) => reader_shared.handle_frame(&text),
                Ok(Message::Binary(data)) => {
                    if let Ok(text) = String::from_utf8(data) {
                        reader_shared.handle_frame(&text);
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "signal_bus::koshare", "router websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "signal_bus::koshare", "router websocket error: {err}");
                        }
                    }
                    break;
                }
            }
        }
        reader_alive.store(false, Ordering::Release);
        // Subscribe waiters on this socket will never see a reply.
        reader_shared.fail_operations();
    });

    let keep_alive_shared = Arc::clone(shared);
    let keep_alive_alive = Arc::clone(&alive);
    let keep_alive_tx = outbound.clone();
    let keep_alive_task = tokio::spawn(async move {
        loop {
            let deadline = *keep_alive_shared.last_send.lock() + keep_alive;
            tokio::time::sleep_until(deadline).await;
            if !keep_alive_alive.load(Ordering::Acquire) {
                break;
            }
            let idle = keep_alive_shared.last_send.lock().elapsed();
            if idle >= keep_alive
                && keep_alive_shared
                    .write(&keep_alive_tx, PacketType::Error, "keep-alive", None, None, None)
                    .is_err()
            {
                break;
            }
        }
    });

    Ok(Link {
        outbound,
        alive,
        tasks: vec![writer, reader, keep_alive_task],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct Router {
        endpoint: String,
        seen: mpsc::UnboundedReceiver<Value>,
        connections: Arc<AtomicU64>,
        hang_up: Arc<tokio::sync::Notify>,
    }

    /// Minimal router: acknowledges subscriptions, reflects broadcasts back
    /// with `src = 7` and forwards every raw frame to `seen`. `hang_up` closes
    /// the current socket from the router side.
    async fn spawn_router() -> Router {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicU64::new(0));
        let hang_up = Arc::new(tokio::sync::Notify::new());
        {
            let connections = Arc::clone(&connections);
            let hang_up = Arc::clone(&hang_up);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let seen_tx = seen_tx.clone();
                    let hang_up = Arc::clone(&hang_up);
                    tokio::spawn(async move {
                        let mut ws = accept_async(socket).await.expect("handshake");
                        loop {
                            let text = tokio::select! {
                                msg = ws.next() => match msg {
                                    Some(Ok(Message::Text(text))) => text,
                                    _ => break,
                                },
                                _ = hang_up.notified() => {
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            };
                            let frame: Value = serde_json::from_str(&text).expect("json");
                            let _ = seen_tx.send(frame.clone());
                            let reply = match frame["type"].as_u64() {
                                Some(2) => Some(json!({
                                    "type": 2,
                                    "topic": frame["topic"],
                                    "id": frame["id"],
                                    "peers": [],
                                })),
                                Some(6) => Some(json!({
                                    "type": 6,
                                    "topic": frame["topic"],
                                    "src": 7,
                                    "body": frame["body"],
                                })),
                                _ => None,
                            };
                            if let Some(reply) = reply {
                                ws.send(Message::Text(reply.to_string())).await.expect("reply");
                            }
                        }
                    });
                }
            });
        }
        Router {
            endpoint: format!("ws://{addr}"),
            seen,
            connections,
            hang_up,
        }
    }

    #[test]
    fn packet_type_wire_values() {
        assert_eq!(PacketType::Broadcast as u8, 6);
        assert_eq!(PacketType::from_wire(4), Some(PacketType::Message));
        assert_eq!(PacketType::from_wire(42), None);
    }

    #[test]
    fn rejects_non_websocket_endpoints() {
        assert!(parse_endpoint("http://example.com").is_err());
        assert!(parse_endpoint("ws://example.com:8888").is_ok());
    }

    #[test_timeout::tokio_timeout_test]
    async fn subscribe_and_broadcast_apply_prefix() {
        let Router {
            endpoint, mut seen, ..
        } = spawn_router().await;
        let client = KoshareClient::connect(&endpoint, "tunnel/")
            .await
            .expect("connect");

        let mut sub = client.subscribe("ping").await.expect("subscribe");
        let subscribe_frame = seen.recv().await.expect("subscribe frame");
        assert_eq!(subscribe_frame["topic"], "tunnel/ping");
        assert_eq!(subscribe_frame["type"], 2);

        client
            .broadcast("ping", json!({"sourceId": "a"}))
            .await
            .expect("broadcast");
        let packet = sub.recv().await.expect("reflected broadcast");
        assert_eq!(packet.topic, "ping");
        assert_eq!(packet.src, 7);
        assert_eq!(packet.kind, PacketKind::Broadcast);
        assert_eq!(packet.body, json!({"sourceId": "a"}));

        client.close();
        assert!(matches!(
            client.broadcast("ping", json!(null)).await,
            Err(BusError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn idle_connection_sends_keep_alive() {
        let Router {
            endpoint, mut seen, ..
        } = spawn_router().await;
        let _client =
            KoshareClient::connect_with_keep_alive(&endpoint, "", Duration::from_millis(50))
                .await
                .expect("connect");
        let frame = seen.recv().await.expect("keep-alive frame");
        assert_eq!(frame["type"], 0);
        assert_eq!(frame["topic"], "keep-alive");
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_socket_reconnects_and_resubscribes_on_next_send() {
        let mut router = spawn_router().await;
        let client = KoshareClient::connect(&router.endpoint, "tunnel/")
            .await
            .expect("connect");
        let mut pings = client.subscribe("ping").await.expect("subscribe ping");
        let _pongs = client.subscribe("pong").await.expect("subscribe pong");
        for _ in 0..2 {
            assert_eq!(router.seen.recv().await.expect("subscribe frame")["type"], 2);
        }

        router.hang_up.notify_one();
        loop {
            let alive = client.link.lock().await.as_ref().is_some_and(Link::is_alive);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client
            .broadcast("ping", json!({"sourceId": "again"}))
            .await
            .expect("broadcast after reconnect");
        assert_eq!(router.connections.load(Ordering::SeqCst), 2);

        let mut resubscribed = Vec::new();
        for _ in 0..2 {
            let frame = router.seen.recv().await.expect("resubscribe frame");
            assert_eq!(frame["type"], 2);
            assert!(frame["id"].is_u64());
            resubscribed.push(frame["topic"].as_str().expect("topic").to_string());
        }
        resubscribed.sort();
        assert_eq!(resubscribed, vec!["tunnel/ping", "tunnel/pong"]);
        assert_eq!(router.seen.recv().await.expect("broadcast frame")["type"], 6);

        let packet = pings.recv().await.expect("delivered on the old subscription");
        assert_eq!(packet.body, json!({"sourceId": "again"}));
    }
}
