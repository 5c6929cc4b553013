//! Bidirectional translation between the local editor tree and the
//! replicated document.
//!
//! ```text
//!   Editor tree (NodeKey)                 DocStore (OpId)
//!   ─────────────────────                 ───────────────
//!   root ─┬─ paragraph #4      ◄──map──►  Root ─┬─ Element 0@a
//!         │   ├─ "He" (bold)                    │   ├─ Char 'H' {bold}
//!         │   └─ "y"                            │   ├─ Char 'e' {bold}
//!         │                                     │   └─ Char 'y'
//!         └─ heading #9        ◄──map──►        └─ Element 7@b
//! ```
//!
//! Only element nodes are mapped. Text runs are flattened into per-char
//! items on the way out and regrouped by format on the way in.
//!
//! Outbound (`to_shared_delta`): each dirty element's flattened children
//! are aligned against the live shared children (prefix/suffix trim, then
//! LCS); the alignment becomes insert/delete/format/retype ops.
//!
//! Inbound (`apply_shared_changes`): only the sequences named by the
//! store event are rebuilt; untouched elements keep their keys.

use std::collections::{BTreeSet, HashMap};

use vibedoc_core::{
    Editor, EditorError, EditorState, NodeKey, Point, Selection, TextFormat, Transaction, UpdateTag,
};

use crate::crdt::{Committed, DocStore, LocalTxn, OpId, Origin, Parent, StoreError, StoreEvent};

/// Upper bound on LCS table cells for one sequence; beyond it the
/// changed middle is replaced wholesale.
const LCS_CELL_LIMIT: usize = 4_000_000;

/// A position anchored to shared items instead of local keys, so it
/// survives concurrent edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SharedPoint {
    /// Before the first child of the sequence.
    Start(Parent),
    /// Right after the given item (live or tombstoned).
    After(OpId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SharedSelection {
    pub anchor: SharedPoint,
    pub focus: SharedPoint,
}

/// Desired child unit derived from the editor tree.
#[derive(Debug, Clone)]
enum Unit {
    Element(NodeKey),
    Char(char, TextFormat),
}

/// Live child unit of the shared document.
#[derive(Debug, Clone)]
enum Current {
    Element(OpId),
    Char(OpId, char, TextFormat),
}

impl Current {
    fn id(&self) -> OpId {
        match self {
            Current::Element(id) | Current::Char(id, _, _) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Keep(usize, usize),
    Delete(usize),
    Insert(usize),
}

fn unit_len(state: &EditorState, key: NodeKey) -> usize {
    if state.is_text(key) {
        state.node(key).map(|n| n.text_len()).unwrap_or(0)
    } else {
        1
    }
}

fn desired_units(state: &EditorState, key: NodeKey) -> Vec<Unit> {
    let mut units = Vec::new();
    for child in state.children(key) {
        match (state.text(*child), state.format(*child)) {
            (Some(text), Some(format)) => units.extend(text.chars().map(|ch| Unit::Char(ch, format))),
            _ => units.push(Unit::Element(*child)),
        }
    }
    units
}

/// Align `desired` against `current`, keeping the longest common
/// subsequence under `matches`.
fn align<D, C>(desired: &[D], current: &[C], matches: impl Fn(&D, &C) -> bool) -> Vec<Step> {
    let (n, m) = (desired.len(), current.len());
    let mut prefix = 0;
    while prefix < n && prefix < m && matches(&desired[prefix], &current[prefix]) {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < n - prefix
        && suffix < m - prefix
        && matches(&desired[n - 1 - suffix], &current[m - 1 - suffix])
    {
        suffix += 1;
    }

    let mut steps: Vec<Step> = (0..prefix).map(|i| Step::Keep(i, i)).collect();
    let (d0, d1, c0, c1) = (prefix, n - suffix, prefix, m - suffix);
    let (a, b) = (d1 - d0, c1 - c0);

    if a > 0 && b > 0 && (a + 1) * (b + 1) <= LCS_CELL_LIMIT {
        let width = b + 1;
        let mut table = vec![0u32; (a + 1) * width];
        for i in (0..a).rev() {
            for j in (0..b).rev() {
                table[i * width + j] = if matches(&desired[d0 + i], &current[c0 + j]) {
                    table[(i + 1) * width + j + 1] + 1
                } else {
                    table[(i + 1) * width + j].max(table[i * width + j + 1])
                };
            }
        }

        let (mut i, mut j) = (0, 0);
        while i < a && j < b {
            if matches(&desired[d0 + i], &current[c0 + j])
                && table[i * width + j] == table[(i + 1) * width + j + 1] + 1
            {
                steps.push(Step::Keep(d0 + i, c0 + j));
                i += 1;
                j += 1;
            } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
                steps.push(Step::Insert(d0 + i));
                i += 1;
            } else {
                steps.push(Step::Delete(c0 + j));
                j += 1;
            }
        }
        steps.extend((i..a).map(|i| Step::Insert(d0 + i)));
        steps.extend((j..b).map(|j| Step::Delete(c0 + j)));
    } else {
        steps.extend((c0..c1).map(Step::Delete));
        steps.extend((d0..d1).map(Step::Insert));
    }

    steps.extend((0..suffix).map(|k| Step::Keep(d1 + k, c1 + k)));
    steps
}

/// Key ⇄ id map between one editor and one store.
pub struct Adapter {
    key_to_id: HashMap<NodeKey, Parent>,
    id_to_key: HashMap<Parent, NodeKey>,
}

impl Adapter {
    pub fn new(root: NodeKey) -> Self {
        let mut adapter = Self { key_to_id: HashMap::new(), id_to_key: HashMap::new() };
        adapter.bind(root, Parent::Root);
        adapter
    }

    pub fn id_for(&self, key: NodeKey) -> Option<Parent> {
        self.key_to_id.get(&key).copied()
    }

    pub fn key_for(&self, id: Parent) -> Option<NodeKey> {
        self.id_to_key.get(&id).copied()
    }

    /// Number of mapped elements, root included.
    pub fn len(&self) -> usize {
        self.key_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_id.is_empty()
    }

    fn bind(&mut self, key: NodeKey, id: Parent) {
        if let Some(old) = self.key_to_id.insert(key, id) {
            if self.id_to_key.get(&old) == Some(&key) {
                self.id_to_key.remove(&old);
            }
        }
        self.id_to_key.insert(id, key);
    }

    /// Drop mappings of elements no longer in `state`.
    fn prune(&mut self, state: &EditorState) {
        self.key_to_id.retain(|key, _| state.is_element(*key));
        let key_to_id = &self.key_to_id;
        self.id_to_key.retain(|id, key| key_to_id.get(key) == Some(id));
    }

    fn unit_matches(&self, desired: &Unit, current: &Current) -> bool {
        match (desired, current) {
            (Unit::Element(key), Current::Element(id)) => {
                self.key_to_id.get(key) == Some(&Parent::Item(*id))
            }
            (Unit::Char(a, _), Current::Char(_, b, _)) => a == b,
            _ => false,
        }
    }

    // ─── Outbound: editor → shared ─────────────────────────────────

    /// Translate one committed editor update into shared ops.
    ///
    /// Only elements in `dirty_elements`, and the parents of
    /// `dirty_leaves` in either snapshot, are diffed.
    pub fn to_shared_delta(
        &mut self,
        store: &mut DocStore,
        origin: Origin,
        prev: &EditorState,
        state: &EditorState,
        dirty_elements: &BTreeSet<NodeKey>,
        dirty_leaves: &BTreeSet<NodeKey>,
    ) -> Committed<()> {
        let mut targets: BTreeSet<NodeKey> = dirty_elements.clone();
        for leaf in dirty_leaves {
            targets.extend(state.parent(*leaf));
            targets.extend(prev.parent(*leaf));
        }
        let mut targets: Vec<NodeKey> = targets.into_iter().filter(|k| state.is_element(*k)).collect();
        targets.sort_by_key(|k| state.depth(*k));

        let committed = store.apply_local_delta(origin, |txn| {
            for key in &targets {
                // Unmapped elements are created whole by their parent.
                if let Some(parent) = self.id_for(*key) {
                    self.reconcile(txn, state, *key, parent)?;
                }
            }
            Ok(())
        });
        self.prune(state);
        committed
    }

    /// Push the entire editor tree into the store (initial seeding).
    pub fn seed(&mut self, store: &mut DocStore, origin: Origin, state: &EditorState) -> Committed<()> {
        let root = state.root();
        let committed = store.apply_local_delta(origin, |txn| self.reconcile(txn, state, root, Parent::Root));
        self.prune(state);
        committed
    }

    fn reconcile(
        &mut self,
        txn: &mut LocalTxn<'_>,
        state: &EditorState,
        key: NodeKey,
        parent: Parent,
    ) -> Result<(), StoreError> {
        if let (Parent::Item(id), Some(kind)) = (parent, state.element_kind(key)) {
            txn.retype(id, kind.clone())?;
        }

        let desired = desired_units(state, key);
        let current: Vec<Current> = txn
            .store()
            .live_children(parent)
            .into_iter()
            .map(|id| match txn.store().char_of(id) {
                Some((ch, format)) => Current::Char(id, ch, format),
                None => Current::Element(id),
            })
            .collect();
        let steps = align(&desired, &current, |d, c| self.unit_matches(d, c));

        let mut left = None;
        for step in steps {
            match step {
                Step::Keep(di, ci) => {
                    match (&desired[di], &current[ci]) {
                        (Unit::Char(_, want), Current::Char(id, _, have)) => {
                            for flag in have.diff(want) {
                                txn.format(*id, flag, want.get(flag))?;
                            }
                        }
                        (Unit::Element(child), Current::Element(id)) => {
                            if let Some(kind) = state.element_kind(*child) {
                                txn.retype(*id, kind.clone())?;
                            }
                        }
                        _ => {}
                    }
                    left = Some(current[ci].id());
                }
                Step::Delete(ci) => {
                    txn.delete(current[ci].id())?;
                }
                Step::Insert(di) => {
                    left = Some(self.insert_unit(txn, state, &desired[di], parent, left)?);
                }
            }
        }
        Ok(())
    }

    fn insert_unit(
        &mut self,
        txn: &mut LocalTxn<'_>,
        state: &EditorState,
        unit: &Unit,
        parent: Parent,
        after: Option<OpId>,
    ) -> Result<OpId, StoreError> {
        match unit {
            Unit::Char(ch, format) => txn.insert_char(parent, after, *ch, *format),
            Unit::Element(key) => {
                let kind = state
                    .element_kind(*key)
                    .cloned()
                    .ok_or_else(|| StoreError::InvalidOp(format!("node {key} is not an element")))?;
                let id = txn.insert_element(parent, after, kind)?;
                self.bind(*key, Parent::Item(id));

                let mut left = None;
                for child in desired_units(state, *key) {
                    left = Some(self.insert_unit(txn, state, &child, Parent::Item(id), left)?);
                }
                Ok(id)
            }
        }
    }

    // ─── Inbound: shared → editor ──────────────────────────────────

    /// Capture the editor selection as shared positions. Must be called
    /// while the editor and the store still agree, i.e. before applying a
    /// remote delta.
    pub fn capture_selection(&self, state: &EditorState, store: &DocStore) -> Option<SharedSelection> {
        let selection = state.selection()?;
        Some(SharedSelection {
            anchor: self.to_shared_point(state, store, selection.anchor)?,
            focus: self.to_shared_point(state, store, selection.focus)?,
        })
    }

    /// Rebuild the local nodes implicated by `event` in one editor update
    /// tagged with `tags`, then restore `selection` when it still resolves.
    pub fn apply_shared_changes(
        &mut self,
        editor: &mut Editor,
        store: &DocStore,
        event: &StoreEvent,
        tags: &[UpdateTag],
        selection: Option<SharedSelection>,
    ) -> Result<(), EditorError> {
        if event.is_empty() {
            return Ok(());
        }
        let mut parents: Vec<Parent> =
            event.changed.iter().copied().filter(|p| store.is_visible(*p)).collect();
        parents.sort_by_key(|p| store.depth(*p));

        editor.update(tags, |txn| {
            for parent in &parents {
                let Some(key) = self.key_for(*parent) else {
                    continue;
                };
                if txn.state().is_element(key) {
                    self.rebuild(txn, store, *parent, key)?;
                }
            }

            for id in &event.retyped {
                let (Some(key), Some(kind)) = (self.key_for(Parent::Item(*id)), store.element_kind(*id)) else {
                    continue;
                };
                if txn.state().is_element(key) {
                    txn.set_element_kind(key, kind.clone())?;
                }
            }

            if let Some(selection) = selection {
                let anchor = self.resolve_point(txn.state(), store, selection.anchor);
                let focus = self.resolve_point(txn.state(), store, selection.focus);
                if let (Some(anchor), Some(focus)) = (anchor, focus) {
                    txn.set_selection(Some(Selection::new(anchor, focus)))?;
                }
            }
            Ok(())
        })?;

        self.prune(editor.state());
        Ok(())
    }

    /// Replace the children of `key` with the live children of `parent`.
    /// Existing text nodes are reused in order; mapped elements are reused
    /// as they are.
    fn rebuild(
        &mut self,
        txn: &mut Transaction<'_>,
        store: &DocStore,
        parent: Parent,
        key: NodeKey,
    ) -> Result<(), EditorError> {
        let mut texts: Vec<NodeKey> = txn
            .state()
            .children(key)
            .iter()
            .filter(|k| txn.state().is_text(**k))
            .copied()
            .collect();
        texts.reverse();

        let mut children = Vec::new();
        let mut run: Option<(String, TextFormat)> = None;
        for id in store.live_children(parent) {
            if let Some((ch, format)) = store.char_of(id) {
                match &mut run {
                    Some((text, current)) if *current == format => text.push(ch),
                    _ => {
                        if let Some(done) = run.take() {
                            children.push(place_run(txn, &mut texts, done)?);
                        }
                        run = Some((ch.to_string(), format));
                    }
                }
            } else {
                if let Some(done) = run.take() {
                    children.push(place_run(txn, &mut texts, done)?);
                }
                children.push(self.materialize(txn, store, id)?);
            }
        }
        if let Some(done) = run.take() {
            children.push(place_run(txn, &mut texts, done)?);
        }

        txn.set_children(key, children)
    }

    fn materialize(&mut self, txn: &mut Transaction<'_>, store: &DocStore, id: OpId) -> Result<NodeKey, EditorError> {
        if let Some(key) = self.key_for(Parent::Item(id)) {
            if txn.state().is_element(key) {
                return Ok(key);
            }
        }
        let kind = store
            .element_kind(id)
            .cloned()
            .ok_or_else(|| EditorError::InvalidSnapshot(format!("shared item {id} is not an element")))?;
        let key = txn.create_element(kind)?;
        self.bind(key, Parent::Item(id));
        self.rebuild(txn, store, Parent::Item(id), key)?;
        Ok(key)
    }

    // ─── Positions ─────────────────────────────────────────────────

    /// Express an editor point relative to shared items.
    pub fn to_shared_point(&self, state: &EditorState, store: &DocStore, point: Point) -> Option<SharedPoint> {
        let (element, units) = if state.is_text(point.key) {
            let parent = state.parent(point.key)?;
            let before: usize = state
                .children(parent)
                .iter()
                .take_while(|k| **k != point.key)
                .map(|k| unit_len(state, *k))
                .sum();
            (parent, before + point.offset)
        } else {
            let before = state
                .children(point.key)
                .iter()
                .take(point.offset)
                .map(|k| unit_len(state, *k))
                .sum();
            (point.key, before)
        };

        let parent = self.id_for(element)?;
        if units == 0 {
            return Some(SharedPoint::Start(parent));
        }
        store.live_children(parent).get(units - 1).map(|id| SharedPoint::After(*id))
    }

    /// Resolve a shared position into an editor point. `None` when its
    /// sequence is no longer visible.
    pub fn resolve_point(&self, state: &EditorState, store: &DocStore, point: SharedPoint) -> Option<Point> {
        let (parent, mut remaining) = match point {
            SharedPoint::Start(parent) => (parent, 0),
            SharedPoint::After(id) => store.position_after(id)?,
        };
        if !store.is_visible(parent) {
            return None;
        }
        let key = self.key_for(parent)?;
        if !state.is_element(key) {
            return None;
        }

        let children = state.children(key);
        for (index, child) in children.iter().enumerate() {
            let len = unit_len(state, *child);
            if state.is_text(*child) {
                if remaining <= len {
                    return Some(Point::new(*child, remaining));
                }
            } else if remaining == 0 {
                return Some(Point::new(key, index));
            }
            remaining -= len;
        }
        Some(Point::new(key, children.len()))
    }
}

fn place_run(
    txn: &mut Transaction<'_>,
    texts: &mut Vec<NodeKey>,
    (text, format): (String, TextFormat),
) -> Result<NodeKey, EditorError> {
    match texts.pop() {
        Some(key) => {
            txn.set_text(key, text)?;
            txn.set_text_format(key, format)?;
            Ok(key)
        }
        None => Ok(txn.create_text(text, format)),
    }
}
