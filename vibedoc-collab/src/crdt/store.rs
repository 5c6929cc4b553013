use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use vibedoc_core::{ElementKind, FormatFlag, Observers, Subscription, TextFormat};

use super::{Content, Delta, Op, OpId, OpKind, Parent, ReplicaId, Stamp, StateVector, StoreError};

/// Deliveries a parked op from an unknown replica survives before it is
/// dropped.
pub const DEFAULT_MAX_PENDING_ROUNDS: u32 = 64;

/// Who caused a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Remote,
    Undo,
    Redo,
    Bootstrap,
}

/// Effective mutation recorded for undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Inserted(OpId),
    Deleted(OpId),
    Formatted { target: OpId, flag: FormatFlag, previous: bool },
    Retyped { target: OpId, previous: ElementKind },
}

/// Summary of one applied batch: which sequences and element kinds changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub origin: Origin,
    pub changed: BTreeSet<Parent>,
    pub retyped: BTreeSet<OpId>,
}

impl StoreEvent {
    pub fn new(origin: Origin) -> Self {
        Self { origin, changed: BTreeSet::new(), retyped: BTreeSet::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.retyped.is_empty()
    }
}

/// Outcome of a local transaction.
///
/// Ops are integrated as they are issued, so `delta` holds every op that
/// reached the store even when `result` is an error.
#[derive(Debug)]
pub struct Committed<R> {
    pub result: Result<R, StoreError>,
    pub delta: Delta,
    pub changes: Vec<Change>,
    pub event: StoreEvent,
}

/// Materialized view of the shared document. Adjacent characters with the
/// same format are merged into one text run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SharedNode {
    Element { id: Option<OpId>, kind: ElementKind, children: Vec<SharedNode> },
    Text { text: String, format: TextFormat },
}

impl SharedNode {
    fn inline_text(&self, out: &mut String) {
        match self {
            SharedNode::Text { text, .. } => out.push_str(text),
            SharedNode::Element { children, .. } => {
                for child in children {
                    child.inline_text(out);
                }
            }
        }
    }

    /// Plain text; top-level blocks separated by newlines.
    pub fn plain_text(&self) -> String {
        match self {
            SharedNode::Text { text, .. } => text.clone(),
            SharedNode::Element { children, .. } => children
                .iter()
                .map(|block| {
                    let mut text = String::new();
                    block.inline_text(&mut text);
                    text
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone)]
enum Body {
    Element { kind: ElementKind, kind_stamp: Stamp },
    Char { ch: char, format: TextFormat, flag_stamps: [Stamp; 3] },
}

#[derive(Debug, Clone)]
struct Item {
    parent: Parent,
    stamp: Stamp,
    body: Body,
    deleted: bool,
    children: Vec<OpId>,
}

impl Item {
    fn is_element(&self) -> bool {
        matches!(self.body, Body::Element { .. })
    }
}

enum Readiness {
    Applied,
    Ready,
    Blocked,
    Invalid(String),
}

struct Pending {
    op: Op,
    rounds: u32,
}

/// One replica of the shared document.
pub struct DocStore {
    replica: ReplicaId,
    items: HashMap<OpId, Item>,
    root_children: Vec<OpId>,
    sv: StateVector,
    lamport: u64,
    /// Every integrated op, in causal order.
    log: Vec<Op>,
    pending: Vec<Pending>,
    max_pending_rounds: u32,
    observers: Observers<StoreEvent>,
}

impl DocStore {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            items: HashMap::new(),
            root_children: Vec::new(),
            sv: StateVector::new(),
            lamport: 0,
            log: Vec::new(),
            pending: Vec::new(),
            max_pending_rounds: DEFAULT_MAX_PENDING_ROUNDS,
            observers: Observers::new(),
        }
    }

    pub fn with_max_pending_rounds(mut self, rounds: u32) -> Self {
        self.max_pending_rounds = rounds;
        self
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.sv
    }

    /// Ops parked until their dependencies arrive.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Observe every applied batch (local and remote).
    pub fn subscribe(&self, callback: impl FnMut(&StoreEvent) + Send + 'static) -> Subscription {
        self.observers.subscribe(callback)
    }

    // ─── Local mutation ────────────────────────────────────────────

    /// Run `f` against the store, issuing local ops. The produced delta is
    /// ready to broadcast.
    pub fn apply_local_delta<R>(
        &mut self,
        origin: Origin,
        f: impl FnOnce(&mut LocalTxn<'_>) -> Result<R, StoreError>,
    ) -> Committed<R> {
        let mut txn = LocalTxn {
            store: self,
            delta: Delta::new(),
            event: StoreEvent::new(origin),
            changes: Vec::new(),
        };
        let result = f(&mut txn);
        let LocalTxn { delta, event, changes, .. } = txn;

        if !event.is_empty() {
            self.observers.emit(&event);
        }
        Committed { result, delta, changes, event }
    }

    // ─── Remote mutation ───────────────────────────────────────────

    /// Decode and apply a remote delta.
    ///
    /// Ops already applied are skipped, ops with missing dependencies are
    /// parked, invalid ops are consumed without effect.
    pub fn apply_remote_delta(&mut self, bytes: &[u8]) -> Result<StoreEvent, StoreError> {
        let delta = Delta::decode(bytes)?;
        Ok(self.apply_delta(delta))
    }

    pub fn apply_delta(&mut self, delta: Delta) -> StoreEvent {
        let mut event = StoreEvent::new(Origin::Remote);
        let mut changes = Vec::new();

        self.pending
            .extend(delta.ops.into_iter().map(|op| Pending { op, rounds: 0 }));
        self.drain_pending(&mut event, &mut changes);
        self.age_pending();

        if !self.pending.is_empty() {
            log::debug!(
                "Replica {}: {} ops parked awaiting causal dependencies",
                self.replica,
                self.pending.len()
            );
        }
        if !event.is_empty() {
            self.observers.emit(&event);
        }
        event
    }

    fn drain_pending(&mut self, event: &mut StoreEvent, changes: &mut Vec<Change>) {
        loop {
            let mut progressed = false;
            for pending in std::mem::take(&mut self.pending) {
                match self.readiness(&pending.op) {
                    Readiness::Applied => {}
                    Readiness::Blocked => self.pending.push(pending),
                    Readiness::Ready => {
                        self.integrate(pending.op, event, changes);
                        progressed = true;
                    }
                    Readiness::Invalid(reason) => {
                        log::warn!("Dropping inapplicable op {}: {reason}", pending.op.id);
                        self.consume(pending.op);
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Ops depending only on replicas this store has seen are kept until
    /// the gap is filled. Ops tied to a replica it has never seen are
    /// dropped after `max_pending_rounds` deliveries.
    fn age_pending(&mut self) {
        let max = self.max_pending_rounds;
        let sv = &self.sv;
        self.pending.retain_mut(|pending| {
            if depends_on_known_replicas(sv, &pending.op) {
                return true;
            }
            pending.rounds += 1;
            if pending.rounds > max {
                log::warn!(
                    "Dropping op {} after {} deliveries: it depends on an unknown replica",
                    pending.op.id,
                    max
                );
                false
            } else {
                true
            }
        });
    }

    fn readiness(&self, op: &Op) -> Readiness {
        let next = self.sv.get(op.id.replica);
        if op.id.clock < next {
            return Readiness::Applied;
        }
        if op.id.clock > next {
            return Readiness::Blocked;
        }

        match &op.kind {
            OpKind::Insert { parent, origin, content } => {
                if let Parent::Item(p) = parent {
                    match self.items.get(p) {
                        None => return Readiness::Blocked,
                        Some(item) if !item.is_element() => {
                            return Readiness::Invalid(format!("insert under text item {p}"));
                        }
                        Some(_) => {}
                    }
                }
                if matches!(content, Content::Element(ElementKind::Root)) {
                    return Readiness::Invalid("nested root element".to_string());
                }
                if let Some(o) = origin {
                    match self.items.get(o) {
                        None => return Readiness::Blocked,
                        Some(item) if item.parent != *parent => {
                            return Readiness::Invalid(format!("origin {o} is not a child of {parent}"));
                        }
                        Some(_) => {}
                    }
                }
                Readiness::Ready
            }
            OpKind::Delete { target } => {
                if self.items.contains_key(target) {
                    Readiness::Ready
                } else {
                    Readiness::Blocked
                }
            }
            OpKind::Format { target, .. } => match self.items.get(target) {
                None => Readiness::Blocked,
                Some(item) if item.is_element() => {
                    Readiness::Invalid(format!("format on element {target}"))
                }
                Some(_) => Readiness::Ready,
            },
            OpKind::Retype { target, kind } => {
                if kind.is_root() {
                    return Readiness::Invalid("retype to root".to_string());
                }
                match self.items.get(target) {
                    None => Readiness::Blocked,
                    Some(item) if !item.is_element() => {
                        Readiness::Invalid(format!("retype on text item {target}"))
                    }
                    Some(_) => Readiness::Ready,
                }
            }
        }
    }

    /// Advance clocks for `op` without applying it.
    fn consume(&mut self, op: Op) {
        self.sv.set(op.id.replica, op.id.clock + 1);
        self.lamport = self.lamport.max(op.lamport);
        self.log.push(op);
    }

    fn integrate(&mut self, op: Op, event: &mut StoreEvent, changes: &mut Vec<Change>) {
        let stamp = op.stamp();
        match &op.kind {
            OpKind::Insert { parent, origin, content } => {
                let index = self.insert_index(*parent, *origin, stamp);
                let body = match content {
                    Content::Element(kind) => Body::Element { kind: kind.clone(), kind_stamp: stamp },
                    Content::Char { ch, format } => Body::Char { ch: *ch, format: *format, flag_stamps: [stamp; 3] },
                };
                self.items.insert(
                    op.id,
                    Item { parent: *parent, stamp, body, deleted: false, children: Vec::new() },
                );
                if let Some(seq) = self.seq_mut(*parent) {
                    seq.insert(index, op.id);
                }
                event.changed.insert(*parent);
                changes.push(Change::Inserted(op.id));
            }
            OpKind::Delete { target } => {
                if let Some(item) = self.items.get_mut(target) {
                    if !item.deleted {
                        item.deleted = true;
                        event.changed.insert(item.parent);
                        changes.push(Change::Deleted(*target));
                    }
                }
            }
            OpKind::Format { target, flag, value } => {
                if let Some(item) = self.items.get_mut(target) {
                    if let Body::Char { format, flag_stamps, .. } = &mut item.body {
                        let slot = &mut flag_stamps[flag.index()];
                        if stamp > *slot {
                            *slot = stamp;
                            let previous = format.get(*flag);
                            if previous != *value {
                                format.set(*flag, *value);
                                event.changed.insert(item.parent);
                                changes.push(Change::Formatted { target: *target, flag: *flag, previous });
                            }
                        }
                    }
                }
            }
            OpKind::Retype { target, kind } => {
                if let Some(item) = self.items.get_mut(target) {
                    if let Body::Element { kind: current, kind_stamp } = &mut item.body {
                        if stamp > *kind_stamp {
                            *kind_stamp = stamp;
                            if *current != *kind {
                                let previous = std::mem::replace(current, kind.clone());
                                event.retyped.insert(*target);
                                changes.push(Change::Retyped { target: *target, previous });
                            }
                        }
                    }
                }
            }
        }
        self.consume(op);
    }

    fn insert_index(&self, parent: Parent, origin: Option<OpId>, stamp: Stamp) -> usize {
        let seq = self.seq(parent);
        let mut index = origin
            .and_then(|o| seq.iter().position(|id| *id == o))
            .map(|p| p + 1)
            .unwrap_or(0);
        while index < seq.len()
            && self.items.get(&seq[index]).map(|i| i.stamp > stamp).unwrap_or(false)
        {
            index += 1;
        }
        index
    }

    fn seq(&self, parent: Parent) -> &[OpId] {
        match parent {
            Parent::Root => &self.root_children,
            Parent::Item(id) => self.items.get(&id).map(|i| i.children.as_slice()).unwrap_or(&[]),
        }
    }

    fn seq_mut(&mut self, parent: Parent) -> Option<&mut Vec<OpId>> {
        match parent {
            Parent::Root => Some(&mut self.root_children),
            Parent::Item(id) => self.items.get_mut(&id).map(|i| &mut i.children),
        }
    }

    // ─── Sync ──────────────────────────────────────────────────────

    /// Every op not covered by `remote`, in causal order.
    pub fn diff(&self, remote: &StateVector) -> Delta {
        Delta {
            ops: self.log.iter().filter(|op| !remote.contains(op.id)).cloned().collect(),
        }
    }

    // ─── Queries ───────────────────────────────────────────────────

    pub fn contains(&self, id: OpId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn is_deleted(&self, id: OpId) -> bool {
        self.items.get(&id).map(|i| i.deleted).unwrap_or(false)
    }

    /// True when `parent` and all its ancestors are live.
    pub fn is_visible(&self, parent: Parent) -> bool {
        let mut cursor = parent;
        loop {
            match cursor {
                Parent::Root => return true,
                Parent::Item(id) => match self.items.get(&id) {
                    Some(item) if !item.deleted => cursor = item.parent,
                    _ => return false,
                },
            }
        }
    }

    pub fn parent_of(&self, id: OpId) -> Option<Parent> {
        self.items.get(&id).map(|i| i.parent)
    }

    pub fn element_kind(&self, id: OpId) -> Option<&ElementKind> {
        match &self.items.get(&id)?.body {
            Body::Element { kind, .. } => Some(kind),
            Body::Char { .. } => None,
        }
    }

    pub fn char_of(&self, id: OpId) -> Option<(char, TextFormat)> {
        match &self.items.get(&id)?.body {
            Body::Char { ch, format, .. } => Some((*ch, *format)),
            Body::Element { .. } => None,
        }
    }

    /// Current content of an item, tombstoned or not.
    pub fn content(&self, id: OpId) -> Option<Content> {
        Some(match &self.items.get(&id)?.body {
            Body::Element { kind, .. } => Content::Element(kind.clone()),
            Body::Char { ch, format, .. } => Content::Char { ch: *ch, format: *format },
        })
    }

    /// Live children of `parent` in document order.
    /// All children of `parent` in document order, tombstones included.
    pub fn sequence(&self, parent: Parent) -> &[OpId] {
        self.seq(parent)
    }

    pub fn live_children(&self, parent: Parent) -> Vec<OpId> {
        self.seq(parent)
            .iter()
            .filter(|id| self.items.get(id).map(|i| !i.deleted).unwrap_or(false))
            .copied()
            .collect()
    }

    /// Number of live siblings at or before `id`. Works for tombstones.
    pub fn position_after(&self, id: OpId) -> Option<(Parent, usize)> {
        let parent = self.parent_of(id)?;
        let mut count = 0;
        for sibling in self.seq(parent) {
            if self.items.get(sibling).map(|i| !i.deleted).unwrap_or(false) {
                count += 1;
            }
            if *sibling == id {
                return Some((parent, count));
            }
        }
        None
    }

    pub fn depth(&self, parent: Parent) -> usize {
        let mut depth = 0;
        let mut cursor = parent;
        while let Parent::Item(id) = cursor {
            depth += 1;
            match self.items.get(&id) {
                Some(item) => cursor = item.parent,
                None => break,
            }
        }
        depth
    }

    /// True when the root has no live children.
    pub fn is_empty(&self) -> bool {
        self.live_children(Parent::Root).is_empty()
    }

    pub fn snapshot(&self) -> SharedNode {
        SharedNode::Element {
            id: None,
            kind: ElementKind::Root,
            children: self.snapshot_children(Parent::Root),
        }
    }

    fn snapshot_children(&self, parent: Parent) -> Vec<SharedNode> {
        let mut out: Vec<SharedNode> = Vec::new();
        for id in self.seq(parent) {
            let Some(item) = self.items.get(id) else {
                continue;
            };
            if item.deleted {
                continue;
            }
            match &item.body {
                Body::Element { kind, .. } => out.push(SharedNode::Element {
                    id: Some(*id),
                    kind: kind.clone(),
                    children: self.snapshot_children(Parent::Item(*id)),
                }),
                Body::Char { ch, format, .. } => match out.last_mut() {
                    Some(SharedNode::Text { text, format: run }) if *run == *format => text.push(*ch),
                    _ => out.push(SharedNode::Text { text: ch.to_string(), format: *format }),
                },
            }
        }
        out
    }

    pub fn text_content(&self) -> String {
        self.snapshot().plain_text()
    }
}

fn depends_on_known_replicas(sv: &StateVector, op: &Op) -> bool {
    let known = |id: OpId| sv.get(id.replica) > 0;
    let referenced = match &op.kind {
        OpKind::Insert { parent, origin, .. } => {
            let parent_known = match parent {
                Parent::Root => true,
                Parent::Item(p) => known(*p),
            };
            parent_known && origin.map_or(true, known)
        }
        OpKind::Delete { target } | OpKind::Format { target, .. } | OpKind::Retype { target, .. } => known(*target),
    };
    known(op.id) && referenced
}

/// Issues local ops. Each op is validated and integrated immediately, so
/// its id can be referenced by later ops of the same transaction.
pub struct LocalTxn<'a> {
    store: &'a mut DocStore,
    delta: Delta,
    event: StoreEvent,
    changes: Vec<Change>,
}

impl LocalTxn<'_> {
    pub fn store(&self) -> &DocStore {
        self.store
    }

    fn submit(&mut self, kind: OpKind) -> Result<OpId, StoreError> {
        let replica = self.store.replica;
        let id = OpId::new(replica, self.store.sv.get(replica));
        let op = Op { id, lamport: self.store.lamport + 1, kind };
        match self.store.readiness(&op) {
            Readiness::Ready => {}
            Readiness::Invalid(reason) => return Err(StoreError::InvalidOp(reason)),
            Readiness::Blocked => {
                return Err(StoreError::InvalidOp(format!("op {id} references unknown items")));
            }
            Readiness::Applied => {
                return Err(StoreError::InvalidOp(format!("clock of {id} already used")));
            }
        }
        self.delta.ops.push(op.clone());
        self.store.integrate(op, &mut self.event, &mut self.changes);
        Ok(id)
    }

    /// Insert `content` in `parent` right after `after` (`None` = first).
    pub fn insert(&mut self, parent: Parent, after: Option<OpId>, content: Content) -> Result<OpId, StoreError> {
        self.submit(OpKind::Insert { parent, origin: after, content })
    }

    pub fn insert_element(&mut self, parent: Parent, after: Option<OpId>, kind: ElementKind) -> Result<OpId, StoreError> {
        self.insert(parent, after, Content::Element(kind))
    }

    pub fn insert_char(
        &mut self,
        parent: Parent,
        after: Option<OpId>,
        ch: char,
        format: TextFormat,
    ) -> Result<OpId, StoreError> {
        self.insert(parent, after, Content::Char { ch, format })
    }

    /// Tombstone `target`. Returns false when it already was.
    pub fn delete(&mut self, target: OpId) -> Result<bool, StoreError> {
        if !self.store.contains(target) {
            return Err(StoreError::UnknownItem(target));
        }
        if self.store.is_deleted(target) {
            return Ok(false);
        }
        self.submit(OpKind::Delete { target })?;
        Ok(true)
    }

    pub fn format(&mut self, target: OpId, flag: FormatFlag, value: bool) -> Result<bool, StoreError> {
        let (_, format) = self.store.char_of(target).ok_or(StoreError::UnknownItem(target))?;
        if format.get(flag) == value {
            return Ok(false);
        }
        self.submit(OpKind::Format { target, flag, value })?;
        Ok(true)
    }

    pub fn retype(&mut self, target: OpId, kind: ElementKind) -> Result<bool, StoreError> {
        let current = self.store.element_kind(target).ok_or(StoreError::UnknownItem(target))?;
        if *current == kind {
            return Ok(false);
        }
        self.submit(OpKind::Retype { target, kind })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn paragraph(store: &mut DocStore) -> (OpId, Delta) {
        let committed = store.apply_local_delta(Origin::Local, |txn| {
            txn.insert_element(Parent::Root, None, ElementKind::Paragraph)
        });
        (committed.result.unwrap(), committed.delta)
    }

    fn type_text(store: &mut DocStore, parent: OpId, after: Option<OpId>, text: &str) -> (Vec<OpId>, Delta) {
        let committed = store.apply_local_delta(Origin::Local, |txn| {
            let mut left = after;
            let mut ids = Vec::new();
            for ch in text.chars() {
                let id = txn.insert_char(Parent::Item(parent), left, ch, TextFormat::PLAIN)?;
                ids.push(id);
                left = Some(id);
            }
            Ok(ids)
        });
        (committed.result.unwrap(), committed.delta)
    }

    fn sync(from: &DocStore, to: &mut DocStore) {
        let delta = from.diff(to.state_vector());
        to.apply_delta(delta);
    }

    #[test]
    fn test_local_insert_snapshot() {
        let mut store = DocStore::new(ReplicaId(1));
        let (p, _) = paragraph(&mut store);
        type_text(&mut store, p, None, "hello");
        assert_eq!(store.text_content(), "hello");
        assert_eq!(store.live_children(Parent::Item(p)).len(), 5);
        assert!(!store.is_empty());
    }

    #[test]
    fn test_concurrent_insert_same_position_converges() {
        for (ra, rb) in [(1, 2), (2, 1)] {
            let mut a = DocStore::new(ReplicaId(ra));
            let mut b = DocStore::new(ReplicaId(rb));
            let (p, seed) = paragraph(&mut a);
            b.apply_delta(seed);

            let (_, da) = type_text(&mut a, p, None, "foo");
            let (_, db) = type_text(&mut b, p, None, "bar");
            a.apply_remote_delta(&db.encode().unwrap()).unwrap();
            b.apply_remote_delta(&da.encode().unwrap()).unwrap();

            assert_eq!(a.snapshot(), b.snapshot());
            let text = a.text_content();
            assert!(text == "foobar" || text == "barfoo", "got {text}");
        }
    }

    #[test]
    fn test_remote_delta_idempotent() {
        let mut a = DocStore::new(ReplicaId(1));
        let mut b = DocStore::new(ReplicaId(2));
        let (p, d1) = paragraph(&mut a);
        let (_, d2) = type_text(&mut a, p, None, "xy");
        let mut delta = d1;
        delta.append(d2);
        let bytes = delta.encode().unwrap();

        b.apply_remote_delta(&bytes).unwrap();
        let once = b.snapshot();
        let event = b.apply_remote_delta(&bytes).unwrap();
        assert!(event.is_empty());
        assert_eq!(b.snapshot(), once);
    }

    #[test]
    fn test_out_of_order_delta_is_parked() {
        let mut a = DocStore::new(ReplicaId(1));
        let mut b = DocStore::new(ReplicaId(2));
        let (p, d1) = paragraph(&mut a);
        let (_, d2) = type_text(&mut a, p, None, "hi");

        let event = b.apply_delta(d2);
        assert!(event.is_empty());
        assert_eq!(b.pending_len(), 2);

        let event = b.apply_delta(d1);
        assert_eq!(b.pending_len(), 0);
        assert!(event.changed.contains(&Parent::Root));
        assert!(event.changed.contains(&Parent::Item(p)));
        assert_eq!(b.text_content(), "hi");
    }

    #[test]
    fn test_concurrent_delete_is_noop() {
        let mut a = DocStore::new(ReplicaId(1));
        let mut b = DocStore::new(ReplicaId(2));
        let (p, _) = paragraph(&mut a);
        let (ids, _) = type_text(&mut a, p, None, "abc");
        sync(&a, &mut b);

        let da = a.apply_local_delta(Origin::Local, |txn| txn.delete(ids[1])).delta;
        let db = b.apply_local_delta(Origin::Local, |txn| txn.delete(ids[1])).delta;
        a.apply_delta(db);
        b.apply_delta(da);

        assert_eq!(a.text_content(), "ac");
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_concurrent_format_last_writer_wins() {
        let mut a = DocStore::new(ReplicaId(1));
        let mut b = DocStore::new(ReplicaId(2));
        let (p, _) = paragraph(&mut a);
        let (ids, _) = type_text(&mut a, p, None, "x");
        sync(&a, &mut b);

        // Same Lamport counter on both sides: replica 2 wins the tie.
        let da = a.apply_local_delta(Origin::Local, |txn| txn.format(ids[0], FormatFlag::Bold, true)).delta;
        let db = b
            .apply_local_delta(Origin::Local, |txn| {
                txn.format(ids[0], FormatFlag::Bold, true)?;
                txn.format(ids[0], FormatFlag::Italic, true)
            })
            .delta;
        a.apply_delta(db);
        b.apply_delta(da);

        assert_eq!(a.snapshot(), b.snapshot());
        let (_, format) = a.char_of(ids[0]).unwrap();
        assert!(format.bold && format.italic);
    }

    #[test]
    fn test_concurrent_retype_converges() {
        let mut a = DocStore::new(ReplicaId(1));
        let mut b = DocStore::new(ReplicaId(2));
        let (p, _) = paragraph(&mut a);
        sync(&a, &mut b);

        let h1 = ElementKind::Heading(vibedoc_core::HeadingLevel::H1);
        let list = ElementKind::List(vibedoc_core::ListKind::Bullet);
        let da = a.apply_local_delta(Origin::Local, |txn| txn.retype(p, h1.clone())).delta;
        let db = b.apply_local_delta(Origin::Local, |txn| txn.retype(p, list.clone())).delta;
        let event = a.apply_delta(db);
        b.apply_delta(da);

        assert!(event.retyped.contains(&p));
        assert_eq!(a.element_kind(p), b.element_kind(p));
        assert_eq!(a.element_kind(p), Some(&list));
    }

    #[test]
    fn test_invalid_op_consumed_without_panic() {
        let mut a = DocStore::new(ReplicaId(1));
        let (p, _) = paragraph(&mut a);
        let (ids, _) = type_text(&mut a, p, None, "a");

        let mut b = DocStore::new(ReplicaId(2));
        sync(&a, &mut b);

        let bogus = Delta {
            ops: vec![Op {
                id: OpId::new(ReplicaId(1), 2),
                lamport: 10,
                kind: OpKind::Insert {
                    parent: Parent::Item(ids[0]),
                    origin: None,
                    content: Content::Char { ch: 'z', format: TextFormat::PLAIN },
                },
            }],
        };
        let event = b.apply_delta(bogus);
        assert!(event.is_empty());
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.state_vector().get(ReplicaId(1)), 3);
        assert_eq!(b.text_content(), "a");
    }

    #[test]
    fn test_permanently_blocked_op_is_dropped() {
        let mut store = DocStore::new(ReplicaId(1)).with_max_pending_rounds(2);
        let orphan = Delta {
            ops: vec![Op {
                id: OpId::new(ReplicaId(9), 5),
                lamport: 6,
                kind: OpKind::Delete { target: OpId::new(ReplicaId(9), 0) },
            }],
        };
        store.apply_delta(orphan);
        assert_eq!(store.pending_len(), 1);
        store.apply_delta(Delta::new());
        assert_eq!(store.pending_len(), 1);
        store.apply_delta(Delta::new());
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_blocked_op_from_known_replica_waits_for_gap() {
        let mut a = DocStore::new(ReplicaId(1));
        let mut b = DocStore::new(ReplicaId(2)).with_max_pending_rounds(2);
        let (p, first) = paragraph(&mut a);
        b.apply_delta(first);

        let (ids, lost) = type_text(&mut a, p, None, "x");
        let (_, later) = type_text(&mut a, p, Some(ids[0]), "y");
        b.apply_delta(later);
        for _ in 0..5 {
            b.apply_delta(Delta::new());
        }
        assert_eq!(b.pending_len(), 1);

        b.apply_delta(lost);
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.text_content(), "xy");
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_diff_covers_missing_ops_only() {
        let mut a = DocStore::new(ReplicaId(1));
        let mut b = DocStore::new(ReplicaId(2));
        let (p, _) = paragraph(&mut a);
        sync(&a, &mut b);
        type_text(&mut a, p, None, "new");

        let diff = a.diff(b.state_vector());
        assert_eq!(diff.len(), 3);
        b.apply_delta(diff);
        assert_eq!(b.snapshot(), a.snapshot());
        assert!(a.diff(b.state_vector()).is_empty());
    }

    #[test]
    fn test_delete_element_hides_subtree() {
        let mut store = DocStore::new(ReplicaId(1));
        let (p, _) = paragraph(&mut store);
        let (ids, _) = type_text(&mut store, p, None, "gone");
        store.apply_local_delta(Origin::Local, |txn| txn.delete(p));
        assert!(store.is_empty());
        assert!(!store.is_visible(Parent::Item(p)));
        assert_eq!(store.position_after(ids[1]), Some((Parent::Item(p), 2)));
    }

    #[test]
    fn test_subscribe_receives_events() {
        let mut store = DocStore::new(ReplicaId(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = store.subscribe(move |e| sink.lock().unwrap().push(e.origin));

        paragraph(&mut store);
        store.apply_delta(Delta::new());
        drop(sub);
        paragraph(&mut store);

        assert_eq!(*seen.lock().unwrap(), vec![Origin::Local]);
    }

    #[test]
    fn test_local_txn_rejects_unknown_reference() {
        let mut store = DocStore::new(ReplicaId(1));
        let ghost = OpId::new(ReplicaId(7), 0);
        let committed = store.apply_local_delta(Origin::Local, |txn| {
            txn.insert_char(Parent::Item(ghost), None, 'x', TextFormat::PLAIN)
        });
        assert!(committed.result.is_err());
        assert!(committed.delta.is_empty());
        assert_eq!(store.state_vector().get(ReplicaId(1)), 0);
    }
}
