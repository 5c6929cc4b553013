//! Per-document fan-out with an explicit peer registry.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; receivers filter out their own frames and frames addressed
//! to someone else.
//!
//! ```text
//!            ┌──────────────── Room (doc_id) ────────────────┐
//! sender ──► │ Frame{sender, target, bytes} ─► broadcast::tx │ ──► rx(peer 1)
//!            │ peers: {1, 2, 3}                              │ ──► rx(peer 2)
//!            └───────────────────────────────────────────────┘ ──► rx(peer 3)
//! ```
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ClientId, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path; read via `stats()`.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One encoded message plus its routing header, shared by all receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: ClientId,
    pub target: Option<ClientId>,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn encode(msg: &SyncMessage) -> Result<Self, ProtocolError> {
        Ok(Self { sender: msg.sender, target: msg.target, bytes: msg.encode()? })
    }

    /// No echo to the sender; directed frames reach their target only.
    pub fn is_for(&self, client: ClientId) -> bool {
        self.sender != client && self.target.map_or(true, |t| t == client)
    }
}

/// Registry entry of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub client_id: ClientId,
    pub joined_at: Instant,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    peers: RwLock<BTreeMap<ClientId, PeerInfo>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the per-peer buffer before a lagging peer starts
    /// losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(BTreeMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register `client` and subscribe it. Returns the receiver and the
    /// peers that were already present, taken under the same lock so
    /// concurrent joins see each other in a consistent order.
    pub async fn join(&self, client: ClientId) -> (broadcast::Receiver<Arc<Frame>>, Vec<ClientId>) {
        let mut peers = self.peers.write().await;
        let existing: Vec<ClientId> = peers.keys().copied().collect();
        peers.insert(client, PeerInfo { client_id: client, joined_at: Instant::now() });
        (self.sender.subscribe(), existing)
    }

    pub async fn remove_peer(&self, client: ClientId) -> Option<PeerInfo> {
        self.peers.write().await.remove(&client)
    }

    /// Encode and fan out `msg`. Returns the number of live receivers.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_frame(Arc::new(Frame::encode(msg)?)))
    }

    /// Fan out a pre-encoded frame.
    pub fn broadcast_frame(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<ClientId> {
        self.peers.read().await.keys().copied().collect()
    }

    pub async fn has_peer(&self, client: ClientId) -> bool {
        self.peers.read().await.contains_key(&client)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A joined room, the peer's receiver, and the peers already present.
pub type Membership = (Arc<BroadcastGroup>, broadcast::Receiver<Arc<Frame>>, Vec<ClientId>);

/// Room manager: maps document ids to broadcast groups so messages are
/// isolated between documents.
pub struct RoomManager {
    rooms: RwLock<BTreeMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self { rooms: RwLock::new(BTreeMap::new()), default_capacity }
    }

    /// Add `client` to the room for `doc_id`, creating the room if needed.
    /// Returns `None` when the room already holds `max_peers` peers.
    ///
    /// The write lock is held from lookup to join, so a concurrent
    /// `remove_if_empty` can never drop the room in between.
    pub async fn join(
        &self,
        doc_id: Uuid,
        client: ClientId,
        max_peers: usize,
    ) -> Option<Membership> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(doc_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        let count = room.peer_count().await;
        if count >= max_peers {
            if count == 0 {
                rooms.remove(&doc_id);
            }
            return None;
        }
        let (rx, peers) = room.join(client).await;
        Some((room, rx, peers))
    }

    pub async fn get(&self, doc_id: Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(&doc_id).cloned()
    }

    /// Drop the room when it has no peers left.
    pub async fn remove_if_empty(&self, doc_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&doc_id) {
            if room.peer_count().await == 0 {
                rooms.remove(&doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_reports_existing_peers() {
        let group = BroadcastGroup::new(16);
        let (_rx1, before1) = group.join(ClientId(1)).await;
        let (_rx2, before2) = group.join(ClientId(2)).await;

        assert!(before1.is_empty());
        assert_eq!(before2, vec![ClientId(1)]);
        assert_eq!(group.peer_count().await, 2);

        group.remove_peer(ClientId(1)).await;
        assert!(!group.has_peer(ClientId(1)).await);
        assert_eq!(group.peers().await, vec![ClientId(2)]);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_filtered_by_receiver() {
        let group = BroadcastGroup::new(16);
        let (mut rx1, _) = group.join(ClientId(1)).await;
        let (mut rx2, _) = group.join(ClientId(2)).await;
        let (mut rx3, _) = group.join(ClientId(3)).await;

        let msg = SyncMessage::update(Uuid::new_v4(), vec![1, 2, 3]).with_sender(ClientId(1));
        // Every receiver gets the frame; filtering is the caller's job.
        assert_eq!(group.broadcast(&msg).unwrap(), 3);

        assert!(!rx1.recv().await.unwrap().is_for(ClientId(1)));
        assert!(rx2.recv().await.unwrap().is_for(ClientId(2)));
        assert!(rx3.recv().await.unwrap().is_for(ClientId(3)));
    }

    #[tokio::test]
    async fn test_directed_frame() {
        let group = BroadcastGroup::new(16);
        let (mut rx2, _) = group.join(ClientId(2)).await;
        let (mut rx3, _) = group.join(ClientId(3)).await;

        let msg = SyncMessage::sync_step2(Uuid::nil(), vec![7], ClientId(3)).with_sender(ClientId(1));
        group.broadcast(&msg).unwrap();

        assert!(!rx2.recv().await.unwrap().is_for(ClientId(2)));
        let frame = rx3.recv().await.unwrap();
        assert!(frame.is_for(ClientId(3)));
        assert_eq!(SyncMessage::decode(&frame.bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let (_rx, _) = group.join(ClientId(1)).await;

        let msg = SyncMessage::ping(Uuid::nil());
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_room_manager_join() {
        let manager = RoomManager::new(16);
        let doc_id = Uuid::new_v4();

        let (room1, _rx1, peers1) = manager.join(doc_id, ClientId(1), 2).await.unwrap();
        let (room2, _rx2, peers2) = manager.join(doc_id, ClientId(2), 2).await.unwrap();

        assert!(Arc::ptr_eq(&room1, &room2));
        assert!(peers1.is_empty());
        assert_eq!(peers2, vec![ClientId(1)]);
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(room1.capacity(), 16);

        assert!(manager.join(doc_id, ClientId(3), 2).await.is_none());
        assert_eq!(room1.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let doc_id = Uuid::new_v4();

        let (room, _rx, _) = manager.join(doc_id, ClientId(1), 8).await.unwrap();

        assert!(!manager.remove_if_empty(doc_id).await);
        assert_eq!(manager.active_documents().await, vec![doc_id]);

        room.remove_peer(ClientId(1)).await;
        assert!(manager.remove_if_empty(doc_id).await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.get(doc_id).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_cleanup_stays_in_registered_room() {
        let manager = Arc::new(RoomManager::new(16));
        let doc_id = Uuid::new_v4();

        for i in 0..200u64 {
            let leaving = ClientId(2 * i + 1);
            let joining = ClientId(2 * i + 2);
            let (first, _rx, _) = manager.join(doc_id, leaving, 8).await.unwrap();
            first.remove_peer(leaving).await;

            let cleanup = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.remove_if_empty(doc_id).await })
            };
            let (room, _rx, _) = manager.join(doc_id, joining, 8).await.unwrap();
            cleanup.await.unwrap();

            let registered = manager.get(doc_id).await.expect("occupied room must stay registered");
            assert!(Arc::ptr_eq(&room, &registered));

            room.remove_peer(joining).await;
            assert!(manager.remove_if_empty(doc_id).await);
        }
    }
}
