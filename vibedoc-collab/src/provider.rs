//! WebSocket transport for the relay.
//!
//! Provides:
//! - Connection lifecycle with automatic reconnect and exponential backoff
//! - Join / Welcome handshake per connection
//! - Heartbeat pings and dead-connection detection
//! - Ordered event stream for the binding
//!
//! ```text
//!   connect() ──► supervisor task ─┬─► connect_async(url/doc_id)
//!                                  │        │ Join ─►        ◄─ Welcome
//!                                  │        ▼
//!                                  │   session loop: outgoing ─► ws
//!                                  │                 ws ─► events
//!                                  │                 heartbeat
//!                                  │        │ lost
//!                                  └── sleep(backoff), backoff *= 2
//! ```
//!
//! A new connection gets a new client id and a fresh outgoing queue;
//! frames queued for a dead connection are discarded, peers catch up
//! through the bootstrap exchange instead.
//!
//! Reference: Kleppmann, Chapter 8 — Unreliable Networks

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::transport::{ConnectionStatus, Transport, TransportEvent};

/// Provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:1234`.
    pub server_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Ping interval; a connection silent for twice this long is dropped.
    pub heartbeat_interval: Duration,
    /// Buffer of both the outgoing queue and the event stream.
    pub event_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:1234".to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            event_capacity: 1024,
        }
    }
}

impl ProviderConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self { server_url: server_url.into(), ..Self::default() }
    }

    /// Room URL for `doc_id`.
    pub fn room_url(&self, doc_id: Uuid) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), doc_id)
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// State shared between the provider handle and its supervisor task.
#[derive(Clone)]
struct Shared {
    config: ProviderConfig,
    doc_id: Uuid,
    status: Arc<watch::Sender<ConnectionStatus>>,
    outgoing: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    events: mpsc::Sender<TransportEvent>,
}

impl Shared {
    async fn set_status(&self, status: ConnectionStatus) {
        if self.status.send_replace(status) != status {
            let _ = self.events.send(TransportEvent::Status(status)).await;
        }
    }

    fn install_outgoing(&self, tx: Option<mpsc::Sender<Vec<u8>>>) {
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }
}

/// WebSocket [`Transport`] with reconnect.
pub struct WsProvider {
    shared: Shared,
    status_rx: watch::Receiver<ConnectionStatus>,
    event_rx: mpsc::Receiver<TransportEvent>,
    supervisor: Option<JoinHandle<()>>,
}

impl WsProvider {
    pub fn new(config: ProviderConfig, doc_id: Uuid) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Shared {
                config,
                doc_id,
                status: Arc::new(status_tx),
                outgoing: Arc::new(Mutex::new(None)),
                events: event_tx,
            },
            status_rx,
            event_rx,
            supervisor: None,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.shared.doc_id
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.shared.config
    }

    /// Wait until the status equals `target`. Returns false on timeout.
    pub async fn wait_for_status(&self, target: ConnectionStatus, timeout: Duration) -> bool {
        let mut rx = self.status_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await.map(|r| r.is_ok()).unwrap_or(false)
    }
}

impl Transport for WsProvider {
    /// Spawn the supervisor. Must be called within a tokio runtime.
    fn connect(&mut self) {
        if self.supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = self.shared.clone();
        self.supervisor = Some(tokio::spawn(supervise(shared)));
    }

    fn disconnect(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
        self.shared.install_outgoing(None);
        if self.shared.status.send_replace(ConnectionStatus::Disconnected) != ConnectionStatus::Disconnected {
            let _ = self.shared.events.try_send(TransportEvent::Status(ConnectionStatus::Disconnected));
        }
    }

    fn send(&mut self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let bytes = msg.encode()?;
        let outgoing = self.shared.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        match outgoing.as_ref() {
            Some(tx) => tx.try_send(bytes).map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    fn events(&mut self) -> &mut mpsc::Receiver<TransportEvent> {
        &mut self.event_rx
    }
}

impl Drop for WsProvider {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

/// Reconnect loop. Runs until aborted.
async fn supervise(shared: Shared) {
    let url = shared.config.room_url(shared.doc_id);
    let mut attempt = 0u32;

    loop {
        shared.set_status(ConnectionStatus::Connecting).await;
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                attempt = 0;
                let reason = run_session(&shared, ws_stream).await;
                log::warn!("Connection to {url} lost: {reason}");
            }
            Err(e) => log::warn!("Failed to connect to {url}: {e}"),
        }
        shared.install_outgoing(None);
        shared.set_status(ConnectionStatus::Disconnected).await;

        attempt += 1;
        let delay = shared.config.backoff(attempt);
        log::info!("Reconnecting to {url} in {delay:?} (attempt {attempt})");
        tokio::time::sleep(delay).await;
    }
}

/// Drive one connection until it fails. Returns why it ended.
async fn run_session<S>(shared: &Shared, ws_stream: tokio_tungstenite::WebSocketStream<S>) -> String
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let join = match SyncMessage::join(shared.doc_id).encode() {
        Ok(bytes) => bytes,
        Err(e) => return e.to_string(),
    };
    if let Err(e) = ws_writer.send(Message::Binary(join.into())).await {
        return e.to_string();
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(shared.config.event_capacity.max(1));
    let heartbeat = shared.config.heartbeat_interval;
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut last_seen = Instant::now();
    let mut joined = false;

    loop {
        tokio::select! {
            Some(bytes) = out_rx.recv() => {
                if let Err(e) = ws_writer.send(Message::Binary(bytes.into())).await {
                    return e.to_string();
                }
            }

            msg = ws_reader.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable frame: {e}");
                                continue;
                            }
                        };
                        match sync_msg.msg_type {
                            MessageType::Welcome if !joined => {
                                let welcome = match sync_msg.welcome_info() {
                                    Ok(w) => w,
                                    Err(e) => return format!("bad welcome: {e}"),
                                };
                                log::info!("Joined doc {} as {}", shared.doc_id, welcome.client_id);
                                joined = true;
                                shared.install_outgoing(Some(out_tx.clone()));
                                shared.set_status(ConnectionStatus::Connected).await;
                                if shared.events.send(TransportEvent::Welcome(welcome)).await.is_err() {
                                    return "event receiver dropped".to_string();
                                }
                            }
                            MessageType::Pong | MessageType::Ping => {}
                            _ => {
                                if shared.events.send(TransportEvent::Message(sync_msg)).await.is_err() {
                                    return "event receiver dropped".to_string();
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return "closed by relay".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return e.to_string(),
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > heartbeat * 2 {
                    return format!("no traffic for {:?}", last_seen.elapsed());
                }
                let ping = match SyncMessage::ping(shared.doc_id).encode() {
                    Ok(bytes) => bytes,
                    Err(e) => return e.to_string(),
                };
                if let Err(e) = ws_writer.send(Message::Binary(ping.into())).await {
                    return e.to_string();
                }
            }
        }
    }
}
