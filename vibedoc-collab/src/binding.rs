//! Synchronization engine: one editor, one shared store, one transport.
//!
//! ## State machine
//!
//! ```text
//!  Disconnected ──connect()──► Connecting ──Connected──► Bootstrapping
//!       ▲                                                    │
//!       │                     first replica: seed, or        │
//!       │                     SyncStep2 / sync_timeout       ▼
//!       └──────────── transport lost ◄──────────────────── Synced
//!
//!  any state ──terminate()──► Terminated
//! ```
//!
//! ## Data flow
//!
//! ```text
//! editor.update() ─► listener ─► pending queue ─► flush() ─► Adapter ─► DocStore ─► Update
//!                    (skips SkipCollab)                                              │
//! transport event ─► flush() ─► DocStore::apply_delta ─► Adapter ─► editor.update()  │
//!                               (tags: Collaboration, SkipCollab)                    ▼
//!                                                                               Transport
//! ```
//!
//! Changes applied from the network carry `SkipCollab`, so the listener
//! never queues them and nothing received is sent again.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;
use vibedoc_core::{
    Editor, EditorError, ElementKind, Observers, Point, Selection, Subscription, Transaction, UpdateEvent, UpdateTag,
};

use crate::adapter::{Adapter, SharedSelection};
use crate::awareness::{AwarenessTracker, CursorColor, ParticipantState};
use crate::crdt::{
    Committed, Delta, DocStore, OpKind, Origin, Parent, ReplicaId, StateVector, StoreEvent, DEFAULT_MAX_PENDING_ROUNDS,
};
use crate::protocol::{ClientId, MessageType, SyncMessage, Welcome};
use crate::transport::{ConnectionStatus, Transport, TransportEvent};
use crate::undo::{UndoManager, DEFAULT_UNDO_DEPTH};

/// Binding settings.
#[derive(Debug, Clone)]
pub struct BindingConfig {
    /// Seed the shared document when this replica joins an empty room.
    pub should_bootstrap: bool,
    pub user_name: String,
    /// Derived from the client id when `None`.
    pub cursor_color: Option<CursorColor>,
    /// How long to wait for a `SyncStep2` before assuming we are synced.
    pub sync_timeout: Duration,
    pub max_pending_rounds: u32,
    /// Minimum gap between state vector requests sent while remote ops
    /// are parked.
    pub resync_interval: Duration,
    pub undo_depth: usize,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            should_bootstrap: true,
            user_name: "Anonymous".to_string(),
            cursor_color: None,
            sync_timeout: Duration::from_secs(5),
            max_pending_rounds: DEFAULT_MAX_PENDING_ROUNDS,
            resync_interval: Duration::from_secs(1),
            undo_depth: DEFAULT_UNDO_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Disconnected,
    Connecting,
    Bootstrapping,
    Synced,
    Terminated,
}

impl SyncState {
    /// Coarse indicator shown to the user.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected | Self::Terminated => "disconnected",
            Self::Connecting | Self::Bootstrapping => "syncing",
            Self::Synced => "connected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindingEvent {
    StateChanged(SyncState),
    HistoryChanged { can_undo: bool, can_redo: bool },
    LeaderChanged { leader: Option<ClientId>, is_local: bool },
    PresenceChanged(Vec<ParticipantState>),
}

/// A remote participant's cursor resolved against the local tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub client_id: ClientId,
    pub name: String,
    pub color: CursorColor,
    pub focused: bool,
    pub anchor: Point,
    pub focus: Point,
}

type PendingQueue = Arc<Mutex<VecDeque<UpdateEvent>>>;

fn lock(queue: &PendingQueue) -> MutexGuard<'_, VecDeque<UpdateEvent>> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

/// Binds an [`Editor`] to a shared document over a [`Transport`].
pub struct Binding<T: Transport> {
    doc_id: Uuid,
    config: BindingConfig,
    editor: Editor,
    store: DocStore,
    adapter: Adapter,
    awareness: AwarenessTracker,
    undo: UndoManager,
    transport: T,
    state: SyncState,
    pending: PendingQueue,
    is_syncing: bool,
    /// This session pushed the initial content.
    seeded: bool,
    bootstrap_deadline: Option<Instant>,
    last_resync: Option<Instant>,
    leader: Option<ClientId>,
    observers: Observers<BindingEvent>,
    subscriptions: Vec<Subscription>,
}

impl<T: Transport> Binding<T> {
    pub fn new(editor: Editor, transport: T, doc_id: Uuid, config: BindingConfig) -> Self {
        let store = DocStore::new(ReplicaId::random()).with_max_pending_rounds(config.max_pending_rounds);
        let adapter = Adapter::new(editor.state().root());
        let awareness = AwarenessTracker::new(config.user_name.clone(), config.cursor_color.unwrap_or_default());
        let undo = UndoManager::new(config.undo_depth);

        let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
        let sink = pending.clone();
        let listener = editor.register_update_listener(move |event| {
            if !event.has_tag(UpdateTag::SkipCollab) {
                lock(&sink).push_back(event.clone());
            }
        });

        Self {
            doc_id,
            config,
            editor,
            store,
            adapter,
            awareness,
            undo,
            transport,
            state: SyncState::Disconnected,
            pending,
            is_syncing: false,
            seeded: false,
            bootstrap_deadline: None,
            last_resync: None,
            leader: None,
            observers: Observers::new(),
            subscriptions: vec![listener],
        }
    }

    // ─── Accessors ─────────────────────────────────────────────────

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn editor(&self) -> &Editor {
        &self.editor
    }

    /// Direct editor access. Edits are picked up by the next `flush`.
    pub fn editor_mut(&mut self) -> &mut Editor {
        &mut self.editor
    }

    pub fn store(&self) -> &DocStore {
        &self.store
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn client_id(&self) -> ClientId {
        self.awareness.client_id()
    }

    pub fn is_leader(&self) -> bool {
        self.awareness.is_leader()
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Plain text of the local tree, one line per block.
    pub fn plain_text(&self) -> String {
        self.editor.state().text_content()
    }

    pub fn subscribe(&self, callback: impl FnMut(&BindingEvent) + Send + 'static) -> Subscription {
        self.observers.subscribe(callback)
    }

    // ─── Lifecycle ─────────────────────────────────────────────────

    pub fn connect(&mut self) {
        if self.state == SyncState::Terminated {
            return;
        }
        self.set_state(SyncState::Connecting);
        self.transport.connect();
        self.drain();
    }

    /// Leave the room. Local editing keeps working; a later `connect`
    /// re-bootstraps.
    pub fn disconnect(&mut self) {
        if self.state == SyncState::Terminated {
            return;
        }
        self.flush();
        self.transport.disconnect();
        self.lost_connection();
    }

    /// Release listeners and the transport. The binding is inert afterwards.
    pub fn terminate(&mut self) {
        if self.state == SyncState::Terminated {
            return;
        }
        self.flush();
        self.transport.disconnect();
        self.subscriptions.clear();
        lock(&self.pending).clear();
        self.awareness.disconnected();
        self.bootstrap_deadline = None;
        self.set_state(SyncState::Terminated);
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state == state {
            return;
        }
        log::debug!("Binding {} state {:?} -> {:?}", self.doc_id, self.state, state);
        self.state = state;
        self.observers.emit(&BindingEvent::StateChanged(state));
    }

    fn lost_connection(&mut self) {
        self.bootstrap_deadline = None;
        self.seeded = false;
        self.awareness.disconnected();
        self.check_leader();
        self.set_state(SyncState::Disconnected);
    }

    // ─── Local edits ───────────────────────────────────────────────

    /// Run an editor update and replicate it.
    pub fn update<R>(
        &mut self,
        tags: &[UpdateTag],
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        let result = self.editor.update(tags, f)?;
        self.flush();
        Ok(result)
    }

    /// Push queued local updates into the store, in commit order, and
    /// broadcast them.
    pub fn flush(&mut self) {
        if self.is_syncing || self.state == SyncState::Terminated {
            return;
        }
        self.is_syncing = true;
        loop {
            let next = lock(&self.pending).pop_front();
            let Some(event) = next else {
                break;
            };
            self.push_local(&event);
        }
        self.is_syncing = false;
        self.sync_cursor();
    }

    fn push_local(&mut self, event: &UpdateEvent) {
        if event.is_selection_only() {
            return;
        }
        let committed = self.adapter.to_shared_delta(
            &mut self.store,
            Origin::Local,
            &event.prev_state,
            &event.state,
            &event.dirty_elements,
            &event.dirty_leaves,
        );
        if let Err(e) = &committed.result {
            log::warn!("Local update only partially replicated: {e}");
        }
        if !event.has_tag(UpdateTag::Historic) {
            self.undo.record(&self.store, &committed.changes, event.has_tag(UpdateTag::HistoryMerge));
            self.emit_history();
        }
        self.send_delta(&committed.delta);
    }

    fn send_delta(&mut self, delta: &Delta) {
        if delta.is_empty() {
            return;
        }
        let bytes = match delta.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode delta: {e}");
                return;
            }
        };
        self.send(SyncMessage::update(self.doc_id, bytes));
    }

    /// Best-effort send; peers that miss a frame catch up on the next
    /// bootstrap exchange.
    fn send(&mut self, msg: SyncMessage) {
        if let Err(e) = self.transport.send(msg) {
            log::debug!("Frame not sent ({e})");
        }
    }

    // ─── Undo / redo ───────────────────────────────────────────────

    pub fn undo(&mut self) -> bool {
        self.flush();
        let selection = self.adapter.capture_selection(self.editor.state(), &self.store);
        match self.undo.undo(&mut self.store) {
            Some(committed) => {
                self.apply_history(committed, selection);
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        self.flush();
        let selection = self.adapter.capture_selection(self.editor.state(), &self.store);
        match self.undo.redo(&mut self.store) {
            Some(committed) => {
                self.apply_history(committed, selection);
                true
            }
            None => false,
        }
    }

    fn apply_history(&mut self, committed: Committed<()>, selection: Option<SharedSelection>) {
        if let Err(e) = &committed.result {
            log::warn!("History step only partially applied: {e}");
        }
        self.apply_to_editor(&committed.event, &[UpdateTag::Historic, UpdateTag::SkipCollab], selection);
        self.send_delta(&committed.delta);
        self.emit_history();
    }

    fn emit_history(&self) {
        self.observers.emit(&BindingEvent::HistoryChanged {
            can_undo: self.undo.can_undo(),
            can_redo: self.undo.can_redo(),
        });
    }

    // ─── Presence ──────────────────────────────────────────────────

    pub fn set_focus(&mut self, focused: bool) {
        if self.awareness.local_state().focused == focused {
            return;
        }
        self.publish_awareness(|s| s.focused = focused);
    }

    /// Attach application data to the local awareness state.
    pub fn set_awareness_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.publish_awareness(move |s| {
            s.extra.insert(key, value);
        });
    }

    /// Remote participants' cursors, resolved to local points. Cursors
    /// whose anchors are not in the local tree (yet) are skipped.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let state = self.editor.state();
        self.awareness
            .remote_states()
            .filter_map(|participant| {
                let selection = participant.selection?;
                Some(RemoteCursor {
                    client_id: participant.client_id,
                    name: participant.name.clone(),
                    color: participant.color,
                    focused: participant.focused,
                    anchor: self.adapter.resolve_point(state, &self.store, selection.anchor)?,
                    focus: self.adapter.resolve_point(state, &self.store, selection.focus)?,
                })
            })
            .collect()
    }

    /// Broadcast the local selection when it moved.
    fn sync_cursor(&mut self) {
        if self.awareness.client_id() == ClientId::UNASSIGNED {
            return;
        }
        let selection = self.adapter.capture_selection(self.editor.state(), &self.store);
        if selection != self.awareness.local_state().selection {
            self.publish_awareness(|s| s.selection = selection);
        }
    }

    fn publish_awareness(&mut self, f: impl FnOnce(&mut ParticipantState)) {
        match self.awareness.set_local_state(f) {
            Ok(payload) => {
                if self.awareness.client_id() != ClientId::UNASSIGNED {
                    self.send(SyncMessage::awareness(self.doc_id, payload));
                }
            }
            Err(e) => log::error!("Failed to encode awareness state: {e}"),
        }
        self.presence_changed();
    }

    fn announce_presence(&mut self) {
        match self.awareness.encode_local() {
            Ok(payload) => self.send(SyncMessage::awareness(self.doc_id, payload)),
            Err(e) => log::error!("Failed to encode awareness state: {e}"),
        }
    }

    fn presence_changed(&mut self) {
        self.observers.emit(&BindingEvent::PresenceChanged(self.awareness.states()));
        self.check_leader();
    }

    fn check_leader(&mut self) {
        let leader = self.awareness.leader();
        if leader != self.leader {
            self.leader = leader;
            self.observers.emit(&BindingEvent::LeaderChanged { leader, is_local: self.awareness.is_leader() });
        }
    }

    // ─── Transport events ──────────────────────────────────────────

    /// Handle everything the transport has delivered so far and check the
    /// bootstrap deadline. Returns the number of events handled.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while self.state != SyncState::Terminated {
            let Ok(event) = self.transport.events().try_recv() else {
                break;
            };
            self.handle_event(event);
            handled += 1;
        }
        self.tick(Instant::now());
        handled
    }

    /// Wait for and handle one transport event. Returns false once the
    /// transport's event stream has ended or the binding is terminated.
    pub async fn step(&mut self) -> bool {
        if self.state == SyncState::Terminated {
            return false;
        }
        self.flush();
        let event = match self.bootstrap_deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(deadline, self.transport.events().recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        self.tick(Instant::now());
                        return true;
                    }
                }
            }
            None => self.transport.events().recv().await,
        };
        match event {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Drive the binding until `done` holds. Returns false on timeout.
    pub async fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !done(self) {
            match tokio::time::timeout_at(deadline, self.step()).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return done(self),
            }
        }
        true
    }

    /// Promote a stalled bootstrap to `Synced` once `sync_timeout` passed.
    pub fn tick(&mut self, now: Instant) {
        if self.state != SyncState::Bootstrapping {
            return;
        }
        if let Some(deadline) = self.bootstrap_deadline {
            if now >= deadline {
                log::warn!(
                    "No sync response for doc {} within {:?}; continuing as synced",
                    self.doc_id,
                    self.config.sync_timeout
                );
                self.mark_synced();
            }
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.state == SyncState::Terminated {
            return;
        }
        // Editor and store must agree before remote changes land.
        self.flush();
        match event {
            TransportEvent::Status(ConnectionStatus::Connecting) => self.set_state(SyncState::Connecting),
            TransportEvent::Status(ConnectionStatus::Connected) => self.set_state(SyncState::Bootstrapping),
            TransportEvent::Status(ConnectionStatus::Disconnected) => {
                if self.state != SyncState::Disconnected {
                    log::warn!("Transport for doc {} disconnected", self.doc_id);
                }
                self.lost_connection();
            }
            TransportEvent::Welcome(welcome) => self.on_welcome(welcome),
            TransportEvent::Message(msg) => self.on_message(msg),
        }
    }

    fn on_welcome(&mut self, welcome: Welcome) {
        log::info!("Binding {} joined as {} ({} peers)", self.doc_id, welcome.client_id, welcome.peers.len());
        self.awareness.welcome(welcome.client_id, &welcome.peers);
        if self.config.cursor_color.is_none() {
            let color = CursorColor::from_client(welcome.client_id);
            if let Err(e) = self.awareness.set_local_state(|s| s.color = color) {
                log::error!("Failed to encode awareness state: {e}");
            }
        }
        self.set_state(SyncState::Bootstrapping);
        self.seeded = false;

        if welcome.peers.is_empty() {
            if self.config.should_bootstrap && self.store.is_empty() {
                self.seed();
            }
            self.mark_synced();
        } else {
            match self.store.state_vector().encode() {
                Ok(sv) => self.send(SyncMessage::sync_step1(self.doc_id, sv)),
                Err(e) => log::error!("Failed to encode state vector: {e}"),
            }
            self.bootstrap_deadline = Some(Instant::now() + self.config.sync_timeout);
        }

        self.sync_cursor();
        self.announce_presence();
        self.presence_changed();
    }

    /// Push the current tree, or a single empty paragraph, as the initial
    /// shared content. Not recorded in history.
    fn seed(&mut self) {
        let root = self.editor.state().root();
        if self.editor.state().children(root).is_empty() {
            let created = self.editor.update(&[UpdateTag::SkipCollab, UpdateTag::HistoryMerge], |txn| {
                let root = txn.root();
                txn.append_element(root, ElementKind::Paragraph)
            });
            if let Err(e) = created {
                log::error!("Failed to create the initial paragraph: {e}");
            }
        }

        let committed = self.adapter.seed(&mut self.store, Origin::Bootstrap, self.editor.state());
        if let Err(e) = &committed.result {
            log::warn!("Seeding only partially succeeded: {e}");
        }
        // The seed covers everything still queued.
        lock(&self.pending).clear();
        log::info!("Seeded doc {} with {} ops", self.doc_id, committed.delta.len());
        self.seeded = true;
        self.send_delta(&committed.delta);
    }

    fn mark_synced(&mut self) {
        self.bootstrap_deadline = None;
        self.set_state(SyncState::Synced);
    }

    fn on_message(&mut self, msg: SyncMessage) {
        if msg.doc_id != self.doc_id {
            log::debug!("Ignoring frame for foreign doc {}", msg.doc_id);
            return;
        }
        match msg.msg_type {
            MessageType::Update => self.apply_remote(msg.sender, &msg.payload),

            MessageType::SyncStep1 => {
                let remote = match StateVector::decode(&msg.payload) {
                    Ok(sv) => sv,
                    Err(e) => {
                        log::warn!("Dropping undecodable state vector from {}: {e}", msg.sender);
                        return;
                    }
                };
                match self.store.diff(&remote).encode() {
                    Ok(diff) => self.send(SyncMessage::sync_step2(self.doc_id, diff, msg.sender)),
                    Err(e) => log::error!("Failed to encode diff: {e}"),
                }
                // Broadcast requests come from newcomers; ask for their
                // offline edits in return.
                if msg.target.is_none() {
                    match self.store.state_vector().encode() {
                        Ok(sv) => {
                            self.send(SyncMessage::sync_step1(self.doc_id, sv).addressed_to(msg.sender));
                        }
                        Err(e) => log::error!("Failed to encode state vector: {e}"),
                    }
                }
            }

            MessageType::SyncStep2 => {
                self.apply_remote(msg.sender, &msg.payload);
                if self.state == SyncState::Bootstrapping {
                    self.mark_synced();
                }
            }

            MessageType::Awareness => {
                let known = self.awareness.contains(msg.sender);
                match self.awareness.apply_remote(msg.sender, &msg.payload) {
                    Ok(true) => {
                        if !known {
                            // Newcomer: let it learn about us.
                            self.announce_presence();
                        }
                        self.presence_changed();
                    }
                    Ok(false) => {}
                    Err(e) => log::debug!("Dropping awareness from {}: {e}", msg.sender),
                }
            }

            MessageType::PeerLeft => {
                if self.awareness.remove(msg.sender) {
                    log::info!("{} left doc {}", msg.sender, self.doc_id);
                    self.presence_changed();
                }
            }

            MessageType::Join | MessageType::Welcome | MessageType::Ping | MessageType::Pong => {}
        }
    }

    fn apply_remote(&mut self, sender: ClientId, bytes: &[u8]) {
        let delta = match Delta::decode(bytes) {
            Ok(delta) => delta,
            Err(e) => {
                log::warn!("Dropping undecodable delta from {sender}: {e}");
                return;
            }
        };
        if delta.is_empty() {
            return;
        }
        if self.seeded && is_seed(&delta) {
            log::warn!("Concurrent seed from {sender} on doc {}; keeping both", self.doc_id);
            self.seeded = false;
        }

        let selection = self.adapter.capture_selection(self.editor.state(), &self.store);
        let event = self.store.apply_delta(delta);
        self.apply_to_editor(&event, &[UpdateTag::Collaboration, UpdateTag::SkipCollab], selection);

        if self.store.pending_len() > 0 {
            self.request_missing(sender);
        }
    }

    /// Ask `sender` for everything we lack. Parked ops mean an earlier
    /// update never arrived.
    fn request_missing(&mut self, sender: ClientId) {
        let now = Instant::now();
        if self.last_resync.is_some_and(|at| now.duration_since(at) < self.config.resync_interval) {
            return;
        }
        self.last_resync = Some(now);
        log::debug!(
            "{} ops parked on doc {}; requesting missing updates from {sender}",
            self.store.pending_len(),
            self.doc_id
        );
        match self.store.state_vector().encode() {
            Ok(sv) => self.send(SyncMessage::sync_step1(self.doc_id, sv).addressed_to(sender)),
            Err(e) => log::error!("Failed to encode state vector: {e}"),
        }
    }

    fn apply_to_editor(&mut self, event: &StoreEvent, tags: &[UpdateTag], selection: Option<SharedSelection>) {
        if event.is_empty() {
            return;
        }
        if let Err(e) = self.adapter.apply_shared_changes(&mut self.editor, &self.store, event, tags, selection) {
            log::warn!("Failed to apply shared changes to the editor: {e}");
        }
    }

    /// Discard the local tree and rebuild it from the shared document.
    pub fn reload(&mut self) -> Result<(), EditorError> {
        self.flush();
        let selection = self.adapter.capture_selection(self.editor.state(), &self.store);
        self.editor.update(&[UpdateTag::SkipCollab], |txn| txn.clear_root())?;
        self.adapter = Adapter::new(self.editor.state().root());

        let mut event = StoreEvent::new(Origin::Remote);
        event.changed = BTreeSet::from([Parent::Root]);
        self.adapter.apply_shared_changes(
            &mut self.editor,
            &self.store,
            &event,
            &[UpdateTag::Collaboration, UpdateTag::SkipCollab],
            selection,
        )
    }

    /// Replace the local selection and broadcast it.
    pub fn set_selection(&mut self, selection: Option<Selection>) -> Result<(), EditorError> {
        self.update(&[], |txn| txn.set_selection(selection))
    }

    /// Editor state as persisted by snapshots.
    pub fn snapshot_json(&self) -> Result<String, EditorError> {
        self.editor.state().to_json()
    }
}

impl<T: Transport> Drop for Binding<T> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// A delta that opens the document: it inserts at the very start of the
/// root.
/// A root insert issued by a replica that had seen no op at all.
fn is_seed(delta: &Delta) -> bool {
    delta.ops.iter().any(|op| {
        op.lamport == 1 && matches!(op.kind, OpKind::Insert { parent: Parent::Root, origin: None, .. })
    })
}
