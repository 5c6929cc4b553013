//! In-process relay and transport for deterministic tests and embedding.
//!
//! Routing mirrors the websocket relay: monotonic client ids, no echo to
//! the sender, directed frames to their target only, `PeerLeft` on
//! disconnect. Every frame goes through the wire codec.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ClientId, MessageType, ProtocolError, SyncMessage, Welcome};
use crate::transport::{ConnectionStatus, Transport, TransportEvent};

const EVENT_CAPACITY: usize = 4096;

#[derive(Default)]
struct RelayState {
    next_client: u64,
    rooms: HashMap<Uuid, BTreeMap<ClientId, mpsc::Sender<TransportEvent>>>,
    sent: HashMap<ClientId, u64>,
    /// Updates still to be lost, per sender.
    dropping: HashMap<ClientId, usize>,
    echo: bool,
}

/// Shared in-memory relay. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A transport for `doc_id` on this relay.
    pub fn transport(&self, doc_id: Uuid) -> MemoryTransport {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        MemoryTransport {
            relay: self.clone(),
            doc_id,
            client: None,
            event_tx,
            event_rx,
        }
    }

    /// Loop every frame back to its sender as well, simulating a relay
    /// that echoes.
    pub fn set_echo(&self, echo: bool) {
        self.lock().echo = echo;
    }

    /// Lose the next `count` updates sent by `client`, as a flaky link would.
    pub fn drop_next_updates(&self, client: ClientId, count: usize) {
        self.lock().dropping.insert(client, count);
    }

    /// Frames routed on behalf of `client`.
    pub fn sent_by(&self, client: ClientId) -> u64 {
        self.lock().sent.get(&client).copied().unwrap_or(0)
    }

    pub fn members(&self, doc_id: Uuid) -> Vec<ClientId> {
        self.lock().rooms.get(&doc_id).map(|r| r.keys().copied().collect()).unwrap_or_default()
    }

    fn join(&self, doc_id: Uuid, events: mpsc::Sender<TransportEvent>) -> Welcome {
        let mut state = self.lock();
        state.next_client += 1;
        let client_id = ClientId(state.next_client);
        let room = state.rooms.entry(doc_id).or_default();
        let peers = room.keys().copied().collect();
        room.insert(client_id, events);
        log::debug!("{client_id} joined in-memory room {doc_id}");
        Welcome { client_id, peers }
    }

    fn leave(&self, doc_id: Uuid, client: ClientId) {
        let mut state = self.lock();
        let Some(room) = state.rooms.get_mut(&doc_id) else {
            return;
        };
        room.remove(&client);
        let left = SyncMessage::peer_left(doc_id, client);
        for tx in room.values() {
            deliver(tx, &left);
        }
        if room.is_empty() {
            state.rooms.remove(&doc_id);
        }
    }

    fn route(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        // Through the codec, as on the wire.
        let msg = SyncMessage::decode(&msg.encode()?)?;
        let mut state = self.lock();
        *state.sent.entry(msg.sender).or_default() += 1;
        if msg.msg_type == MessageType::Update {
            if let Some(left) = state.dropping.get_mut(&msg.sender).filter(|left| **left > 0) {
                *left -= 1;
                log::debug!("Losing update from {}", msg.sender);
                return Ok(());
            }
        }
        let echo = state.echo;
        let Some(room) = state.rooms.get(&msg.doc_id) else {
            return Err(ProtocolError::ConnectionClosed);
        };
        for (client, tx) in room {
            if msg.is_for(*client) || (echo && *client == msg.sender) {
                deliver(tx, &msg);
            }
        }
        Ok(())
    }
}

fn deliver(tx: &mpsc::Sender<TransportEvent>, msg: &SyncMessage) {
    if tx.try_send(TransportEvent::Message(msg.clone())).is_err() {
        log::warn!("In-memory peer queue full or closed; dropping {:?}", msg.msg_type);
    }
}

/// Transport bound to a [`MemoryRelay`]. Connecting succeeds immediately.
pub struct MemoryTransport {
    relay: MemoryRelay,
    doc_id: Uuid,
    client: Option<ClientId>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: mpsc::Receiver<TransportEvent>,
}

impl MemoryTransport {
    pub fn client_id(&self) -> Option<ClientId> {
        self.client
    }

    fn push(&self, event: TransportEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::warn!("In-memory transport event queue full");
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self) {
        if self.client.is_some() {
            return;
        }
        self.push(TransportEvent::Status(ConnectionStatus::Connecting));
        let welcome = self.relay.join(self.doc_id, self.event_tx.clone());
        self.client = Some(welcome.client_id);
        self.push(TransportEvent::Status(ConnectionStatus::Connected));
        self.push(TransportEvent::Welcome(welcome));
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            self.relay.leave(self.doc_id, client);
            self.push(TransportEvent::Status(ConnectionStatus::Disconnected));
        }
    }

    fn send(&mut self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let client = self.client.ok_or(ProtocolError::ConnectionClosed)?;
        self.relay.route(msg.with_sender(client))
    }

    fn status(&self) -> ConnectionStatus {
        if self.client.is_some() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    fn events(&mut self) -> &mut mpsc::Receiver<TransportEvent> {
        &mut self.event_rx
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.relay.leave(self.doc_id, client);
        }
    }
}
