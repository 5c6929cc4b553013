//! Ephemeral per-participant presence: identity, color, focus and
//! cursor, plus deterministic leader election.
//!
//! ## Architecture
//!
//! ```text
//! Local selection change
//!       │
//!       ▼
//! AwarenessTracker::set_local_state()  ── clock += 1
//!       │
//!       ▼   encoded ParticipantState (bincode)
//! SyncMessage::Awareness  ──►  relay  ──►  remote trackers
//!                                              │
//!                                              ▼
//!                              apply_remote() (stale clocks dropped)
//!                                              │
//!                                              ▼
//!                              AwarenessEvent { states, leader }
//! ```
//!
//! Entries live as long as the transport connection: a `PeerLeft` from
//! the relay (close or heartbeat timeout) removes them.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use vibedoc_core::{Observers, Subscription};

use crate::adapter::SharedSelection;
use crate::protocol::{decode_payload, encode_payload, ClientId, ProtocolError};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// 8-bit RGB color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    /// Stable, visually distinct color for a client id.
    ///
    /// Successive ids are spread around the hue circle by the golden
    /// ratio, at high saturation for vivid cursors.
    pub fn from_client(id: ClientId) -> Self {
        let hue = (id.0 as f32 * 0.618_034).fract();
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
        Self { r: to_byte(r), g: to_byte(g), b: to_byte(b) }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn parse_hex(value: &str) -> Option<Self> {
        let hex = value.strip_prefix('#')?;
        if hex.len() != 6 {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        Some(Self { r: channel(0)?, g: channel(2)?, b: channel(4)? })
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0x42, g: 0x85, b: 0xf4 }
    }
}

fn to_byte(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (hue_to_rgb(p, q, h + 1.0 / 3.0), hue_to_rgb(p, q, h), hue_to_rgb(p, q, h - 1.0 / 3.0))
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Participant state
// ───────────────────────────────────────────────────────────────────

/// One participant's presence record as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub client_id: ClientId,
    pub name: String,
    pub color: CursorColor,
    pub focused: bool,
    /// Cursor/selection in shared coordinates. `None` while blurred or
    /// before the first selection.
    pub selection: Option<SharedSelection>,
    /// Free-form application data.
    pub extra: BTreeMap<String, String>,
    /// Sender-local counter; older updates are ignored.
    pub clock: u64,
    /// Unix milliseconds of the last local change.
    pub updated_at: u64,
}

impl ParticipantState {
    pub fn new(client_id: ClientId, name: impl Into<String>, color: CursorColor) -> Self {
        Self {
            client_id,
            name: name.into(),
            color,
            focused: false,
            selection: None,
            extra: BTreeMap::new(),
            clock: 0,
            updated_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The participant with the smallest client id leads.
pub fn pick_leader(ids: impl IntoIterator<Item = ClientId>) -> Option<ClientId> {
    ids.into_iter().min()
}

/// Snapshot delivered to `on_update` subscribers after every change.
#[derive(Debug, Clone)]
pub struct AwarenessEvent {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    /// All known participants, local included, ordered by id.
    pub states: Vec<ParticipantState>,
    pub leader: Option<ClientId>,
    pub leader_changed: bool,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Awareness table of one binding. Written only by `set_local_state`
/// and the remote-update handlers.
pub struct AwarenessTracker {
    local: ParticipantState,
    remote: BTreeMap<ClientId, ParticipantState>,
    leader: Option<ClientId>,
    observers: Observers<AwarenessEvent>,
}

impl AwarenessTracker {
    pub fn new(name: impl Into<String>, color: CursorColor) -> Self {
        Self {
            local: ParticipantState::new(ClientId::UNASSIGNED, name, color),
            remote: BTreeMap::new(),
            leader: None,
            observers: Observers::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.local.client_id
    }

    pub fn local_state(&self) -> &ParticipantState {
        &self.local
    }

    pub fn on_update(&self, callback: impl FnMut(&AwarenessEvent) + Send + 'static) -> Subscription {
        self.observers.subscribe(callback)
    }

    /// Adopt the id assigned by the relay and forget participants that
    /// are not in `peers`.
    pub fn welcome(&mut self, client_id: ClientId, peers: &[ClientId]) {
        let removed: Vec<ClientId> = self.remote.keys().filter(|id| !peers.contains(id)).copied().collect();
        for id in &removed {
            self.remote.remove(id);
        }
        self.local.client_id = client_id;
        self.notify(Vec::new(), vec![client_id], removed);
    }

    /// Connection lost: the local id is void until the next welcome.
    pub fn disconnected(&mut self) {
        let removed: Vec<ClientId> = std::mem::take(&mut self.remote).into_keys().collect();
        self.local.client_id = ClientId::UNASSIGNED;
        self.notify(Vec::new(), Vec::new(), removed);
    }

    /// Mutate the local state and return its encoded form for broadcast.
    pub fn set_local_state(&mut self, f: impl FnOnce(&mut ParticipantState)) -> Result<Vec<u8>, ProtocolError> {
        f(&mut self.local);
        self.local.clock += 1;
        self.local.updated_at = now_millis();
        let id = self.local.client_id;
        self.notify(Vec::new(), vec![id], Vec::new());
        self.encode_local()
    }

    /// Current local state, encoded; resent on every (re)connect.
    pub fn encode_local(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(&self.local)
    }

    /// Apply a remote awareness payload sent by `sender`. Returns whether
    /// the table changed.
    pub fn apply_remote(&mut self, sender: ClientId, payload: &[u8]) -> Result<bool, ProtocolError> {
        let mut state: ParticipantState = decode_payload(payload)?;
        if sender == self.local.client_id {
            return Ok(false);
        }
        if state.client_id != sender {
            log::debug!("Awareness from {sender} claims id {}; using relay id", state.client_id);
            state.client_id = sender;
        }

        let added = match self.remote.get(&sender) {
            Some(existing) if existing.clock >= state.clock => return Ok(false),
            Some(_) => false,
            None => true,
        };
        self.remote.insert(sender, state);
        if added {
            self.notify(vec![sender], Vec::new(), Vec::new());
        } else {
            self.notify(Vec::new(), vec![sender], Vec::new());
        }
        Ok(true)
    }

    pub fn remove(&mut self, client: ClientId) -> bool {
        if self.remote.remove(&client).is_none() {
            return false;
        }
        self.notify(Vec::new(), Vec::new(), vec![client]);
        true
    }

    pub fn contains(&self, client: ClientId) -> bool {
        client == self.local.client_id || self.remote.contains_key(&client)
    }

    pub fn remote_states(&self) -> impl Iterator<Item = &ParticipantState> {
        self.remote.values()
    }

    /// All participants, local first when it has an id, then by id.
    pub fn states(&self) -> Vec<ParticipantState> {
        let mut states: Vec<ParticipantState> = self.remote.values().cloned().collect();
        if self.local.client_id != ClientId::UNASSIGNED {
            states.push(self.local.clone());
        }
        states.sort_by_key(|s| s.client_id);
        states
    }

    pub fn participants(&self) -> Vec<ClientId> {
        self.states().into_iter().map(|s| s.client_id).collect()
    }

    pub fn leader(&self) -> Option<ClientId> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.local.client_id != ClientId::UNASSIGNED && self.leader == Some(self.local.client_id)
    }

    fn notify(&mut self, added: Vec<ClientId>, updated: Vec<ClientId>, removed: Vec<ClientId>) {
        let states = self.states();
        let leader = pick_leader(states.iter().map(|s| s.client_id));
        let leader_changed = leader != self.leader;
        if leader_changed {
            log::info!("Leader changed: {:?} -> {:?}", self.leader, leader);
            self.leader = leader;
        }
        self.observers.emit(&AwarenessEvent { added, updated, removed, states, leader, leader_changed });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn remote_payload(id: u64, name: &str, clock: u64) -> Vec<u8> {
        let mut state = ParticipantState::new(ClientId(id), name, CursorColor::from_client(ClientId(id)));
        state.clock = clock;
        encode_payload(&state).unwrap()
    }

    #[test]
    fn test_pick_leader() {
        assert_eq!(pick_leader([ClientId(7), ClientId(3), ClientId(9)]), Some(ClientId(3)));
        assert_eq!(pick_leader([ClientId(7), ClientId(9)]), Some(ClientId(7)));
        assert_eq!(pick_leader(Vec::new()), None);
    }

    #[test]
    fn test_leader_follows_membership() {
        let mut tracker = AwarenessTracker::new("me", CursorColor::default());
        tracker.welcome(ClientId(7), &[ClientId(3)]);
        tracker.apply_remote(ClientId(3), &remote_payload(3, "three", 1)).unwrap();
        tracker.apply_remote(ClientId(9), &remote_payload(9, "nine", 1)).unwrap();
        assert_eq!(tracker.leader(), Some(ClientId(3)));
        assert!(!tracker.is_leader());

        tracker.remove(ClientId(3));
        assert_eq!(tracker.leader(), Some(ClientId(7)));
        assert!(tracker.is_leader());
    }

    #[test]
    fn test_stale_update_ignored() {
        let mut tracker = AwarenessTracker::new("me", CursorColor::default());
        tracker.welcome(ClientId(1), &[]);
        assert!(tracker.apply_remote(ClientId(2), &remote_payload(2, "new", 5)).unwrap());
        assert!(!tracker.apply_remote(ClientId(2), &remote_payload(2, "old", 4)).unwrap());

        let names: Vec<String> = tracker.remote_states().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["new".to_string()]);
    }

    #[test]
    fn test_sender_id_is_authoritative() {
        let mut tracker = AwarenessTracker::new("me", CursorColor::default());
        tracker.welcome(ClientId(1), &[]);
        tracker.apply_remote(ClientId(4), &remote_payload(99, "spoof", 1)).unwrap();
        assert_eq!(tracker.participants(), vec![ClientId(1), ClientId(4)]);
    }

    #[test]
    fn test_on_update_reports_states() {
        let mut tracker = AwarenessTracker::new("me", CursorColor::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = tracker.on_update(move |e| sink.lock().unwrap().push((e.states.len(), e.leader)));

        tracker.welcome(ClientId(5), &[]);
        tracker.set_local_state(|s| s.focused = true).unwrap();
        tracker.apply_remote(ClientId(2), &remote_payload(2, "two", 1)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(1, Some(ClientId(5))), (1, Some(ClientId(5))), (2, Some(ClientId(2)))]);
    }

    #[test]
    fn test_welcome_drops_departed_peers() {
        let mut tracker = AwarenessTracker::new("me", CursorColor::default());
        tracker.welcome(ClientId(4), &[ClientId(2)]);
        tracker.apply_remote(ClientId(2), &remote_payload(2, "two", 1)).unwrap();

        tracker.disconnected();
        assert!(tracker.states().is_empty());
        assert_eq!(tracker.leader(), None);

        tracker.welcome(ClientId(8), &[]);
        assert_eq!(tracker.participants(), vec![ClientId(8)]);
    }

    #[test]
    fn test_cursor_color_stable_and_hex() {
        let a = CursorColor::from_client(ClientId(3));
        assert_eq!(a, CursorColor::from_client(ClientId(3)));
        assert_ne!(a, CursorColor::from_client(ClientId(4)));
        assert_eq!(CursorColor::parse_hex(&a.to_hex()), Some(a));
        assert_eq!(CursorColor::parse_hex("#12345"), None);
    }
}
