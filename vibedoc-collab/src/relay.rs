//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                              ┌──► Client B
//!             ├── Room (doc_id) ── BroadcastGroup
//! Client C ──┘     peers {1,2,3}            └──► Client C (directed only)
//! ```
//!
//! The relay is a pure pub/sub hop: it assigns client ids, stamps the
//! sender on every frame, fans frames out (never back to the sender,
//! directed frames only to their target) and announces departures.
//! It never decodes document deltas.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame, RoomManager};
use crate::protocol::{ClientId, MessageType, SyncMessage, Welcome};

pub type RelayResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Expected client heartbeat interval; silent for twice this long
    /// means gone
    pub heartbeat_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `VIBEDOC_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; unparsable values are logged and
    /// ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>, slot: &mut T) {
            if let Some(raw) = value {
                match raw.trim().parse() {
                    Ok(parsed) => *slot = parsed,
                    Err(_) => log::warn!("Ignoring invalid {key}={raw:?}"),
                }
            }
        }

        if let Some(addr) = lookup("VIBEDOC_RELAY_ADDR") {
            self.bind_addr = addr;
        }
        parse("VIBEDOC_MAX_PEERS", lookup("VIBEDOC_MAX_PEERS"), &mut self.max_peers_per_room);
        parse(
            "VIBEDOC_BROADCAST_CAPACITY",
            lookup("VIBEDOC_BROADCAST_CAPACITY"),
            &mut self.broadcast_capacity,
        );
        parse(
            "VIBEDOC_HEARTBEAT_SECS",
            lookup("VIBEDOC_HEARTBEAT_SECS"),
            &mut self.heartbeat_interval_secs,
        );
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1) * 2)
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
}

/// Shared by every connection task.
#[derive(Clone)]
struct RelayContext {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
    next_client: Arc<AtomicU64>,
}

impl RelayContext {
    fn next_client_id(&self) -> ClientId {
        ClientId(self.next_client.fetch_add(1, Ordering::SeqCst))
    }
}

/// Membership of one connection once it has joined.
struct Joined {
    client: ClientId,
    doc_id: Uuid,
    room: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Arc<Frame>>,
}

/// The relay server.
pub struct RelayServer {
    ctx: RelayContext,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            ctx: RelayContext {
                config,
                rooms,
                stats: Arc::new(RwLock::new(RelayStats::default())),
                next_client: Arc::new(AtomicU64::new(1)),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> RelayResult<()> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> RelayResult<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.ctx.rooms
    }
}

async fn recv_frame(joined: &mut Option<Joined>) -> Result<Arc<Frame>, broadcast::error::RecvError> {
    match joined {
        Some(j) => j.rx.recv().await,
        // Not joined yet: wait forever
        None => std::future::pending().await,
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: RelayContext) -> RelayResult<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::debug!("WebSocket connection established from {addr}");

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let idle_timeout = ctx.config.idle_timeout();
    let mut idle_check = tokio::time::interval(idle_timeout / 2);
    let mut last_seen = Instant::now();
    let mut joined: Option<Joined> = None;

    let outcome = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            match (sync_msg.msg_type, &joined) {
                                (MessageType::Join, None) => {
                                    let client = ctx.next_client_id();
                                    let membership = ctx
                                        .rooms
                                        .join(sync_msg.doc_id, client, ctx.config.max_peers_per_room)
                                        .await;
                                    let Some((room, rx, peers)) = membership else {
                                        log::warn!("Room {} full, rejecting {addr}", sync_msg.doc_id);
                                        ctx.stats.write().await.rejected_joins += 1;
                                        ws_sender.send(Message::Close(None)).await?;
                                        break;
                                    };
                                    let welcome = SyncMessage::welcome(
                                        sync_msg.doc_id,
                                        &Welcome { client_id: client, peers: peers.clone() },
                                    )?;
                                    ws_sender.send(Message::Binary(welcome.encode()?.into())).await?;
                                    ctx.stats.write().await.active_rooms = ctx.rooms.room_count().await;

                                    log::info!(
                                        "{client} ({addr}) joined doc {} with {} peers",
                                        sync_msg.doc_id,
                                        peers.len()
                                    );
                                    joined = Some(Joined { client, doc_id: sync_msg.doc_id, room, rx });
                                }

                                (MessageType::Join, Some(j)) => {
                                    log::warn!("{} sent a second Join; ignored", j.client);
                                }

                                (MessageType::Ping, _) => {
                                    let pong = SyncMessage::pong(sync_msg.doc_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                (MessageType::Pong, _) => {}

                                (
                                    MessageType::Update
                                    | MessageType::SyncStep1
                                    | MessageType::SyncStep2
                                    | MessageType::Awareness,
                                    Some(j),
                                ) => {
                                    if sync_msg.doc_id != j.doc_id {
                                        log::warn!("{} sent a frame for foreign doc {}", j.client, sync_msg.doc_id);
                                        continue;
                                    }
                                    if sync_msg.msg_type == MessageType::Awareness {
                                        log::trace!("Awareness from {} in room {}", j.client, j.doc_id);
                                    }
                                    let stamped = sync_msg.with_sender(j.client);
                                    j.room.broadcast(&stamped)?;
                                }

                                (other, _) => {
                                    log::debug!("Unhandled message type {other:?} from {addr}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = recv_frame(&mut joined) => {
                    let Some(j) = joined.as_ref() else { continue };
                    match frame {
                        Ok(frame) => {
                            if frame.is_for(j.client) {
                                ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {} lagged by {n} messages", j.client);
                            j.room.record_dropped(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = idle_check.tick() => {
                    if last_seen.elapsed() > idle_timeout {
                        log::info!("Dropping {addr}: silent for {:?}", last_seen.elapsed());
                        break;
                    }
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    // Cleanup: unregister and announce the departure
    if let Some(j) = joined {
        j.room.remove_peer(j.client).await;
        if let Err(e) = j.room.broadcast(&SyncMessage::peer_left(j.doc_id, j.client)) {
            log::warn!("Failed to announce departure of {}: {e}", j.client);
        }
        log::info!("{} left doc {}", j.client, j.doc_id);
        if ctx.rooms.remove_if_empty(j.doc_id).await {
            log::info!("Room {} removed (empty)", j.doc_id);
        }
    }

    {
        let mut s = ctx.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = ctx.rooms.room_count().await;
    }

    outcome
}
