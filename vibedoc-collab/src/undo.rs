//! Local undo/redo over the shared document.
//!
//! Only changes made by this replica are recorded. Undoing issues new
//! inverse ops, so remote peers see an undo as an ordinary edit and
//! concurrent remote work is left alone.
//!
//! A deleted item cannot be revived in place (tombstones are final), so
//! undoing a delete inserts a copy right after the tombstone and remembers
//! the old → new id mapping for older history entries.

use std::collections::{HashMap, HashSet};

use crate::crdt::{Change, Committed, Content, DocStore, LocalTxn, OpId, Origin, Parent, StoreError};

pub const DEFAULT_UNDO_DEPTH: usize = 100;

/// Undo and redo stacks of change batches.
pub struct UndoManager {
    undo: Vec<Vec<Change>>,
    redo: Vec<Vec<Change>>,
    depth: usize,
    remap: HashMap<OpId, OpId>,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_DEPTH)
    }
}

impl UndoManager {
    pub fn new(depth: usize) -> Self {
        Self { undo: Vec::new(), redo: Vec::new(), depth: depth.max(1), remap: HashMap::new() }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.remap.clear();
    }

    /// Record a local change batch. With `merge`, the batch joins the most
    /// recent entry instead of opening a new one. Clears the redo stack.
    pub fn record(&mut self, store: &DocStore, changes: &[Change], merge: bool) {
        let changes = collapse(store, changes);
        if changes.is_empty() {
            return;
        }
        self.redo.clear();
        match self.undo.last_mut() {
            Some(top) if merge => top.extend(changes),
            _ => {
                self.undo.push(changes);
                if self.undo.len() > self.depth {
                    self.undo.remove(0);
                }
            }
        }
    }

    /// Revert the most recent entry. `None` when there is nothing to undo.
    pub fn undo(&mut self, store: &mut DocStore) -> Option<Committed<()>> {
        let batch = self.undo.pop()?;
        let committed = self.invert(store, batch, Origin::Undo);
        let inverse = collapse(store, &committed.changes);
        if !inverse.is_empty() {
            self.redo.push(inverse);
        }
        Some(committed)
    }

    pub fn redo(&mut self, store: &mut DocStore) -> Option<Committed<()>> {
        let batch = self.redo.pop()?;
        let committed = self.invert(store, batch, Origin::Redo);
        let inverse = collapse(store, &committed.changes);
        if !inverse.is_empty() {
            self.undo.push(inverse);
        }
        Some(committed)
    }

    fn resolve(&self, mut id: OpId) -> OpId {
        while let Some(next) = self.remap.get(&id) {
            id = *next;
        }
        id
    }

    /// Like `resolve`, also consulting copies made earlier in the same step.
    fn resolve_in(&self, restored: &[(OpId, OpId)], id: OpId) -> OpId {
        let mut id = self.resolve(id);
        while let Some((_, new)) = restored.iter().rev().find(|(old, _)| *old == id) {
            id = *new;
        }
        id
    }

    fn invert(&mut self, store: &mut DocStore, batch: Vec<Change>, origin: Origin) -> Committed<()> {
        let mut restored: Vec<(OpId, OpId)> = Vec::new();
        let committed = store.apply_local_delta(origin, |txn| {
            for change in batch.iter().rev() {
                if let Err(e) = self.invert_one(txn, change, &mut restored) {
                    log::warn!("Skipping {origin:?} step {change:?}: {e}");
                }
            }
            Ok(())
        });
        self.remap.extend(restored);
        committed
    }

    /// Where a copy of the tombstone `target` goes. When its parent was
    /// itself restored, the copy lands in the new parent right after the
    /// copy of its nearest earlier sibling.
    fn restore_position(
        &self,
        store: &DocStore,
        restored: &[(OpId, OpId)],
        target: OpId,
        parent: Parent,
    ) -> (Parent, Option<OpId>) {
        let Parent::Item(old) = parent else {
            return (parent, Some(target));
        };
        let new = self.resolve_in(restored, old);
        if new == old {
            return (parent, Some(target));
        }
        let siblings = store.sequence(parent);
        let index = siblings.iter().position(|s| *s == target).unwrap_or(0);
        let anchor = siblings[..index]
            .iter()
            .rev()
            .map(|s| self.resolve_in(restored, *s))
            .find(|s| store.parent_of(*s) == Some(Parent::Item(new)) && !store.is_deleted(*s));
        (Parent::Item(new), anchor)
    }

    fn invert_one(
        &self,
        txn: &mut LocalTxn<'_>,
        change: &Change,
        restored: &mut Vec<(OpId, OpId)>,
    ) -> Result<(), StoreError> {
        match change {
            Change::Inserted(id) => {
                txn.delete(self.resolve_in(restored, *id))?;
            }
            Change::Deleted(id) => {
                let target = self.resolve_in(restored, *id);
                if txn.store().is_deleted(target) {
                    let parent = txn.store().parent_of(target).ok_or(StoreError::UnknownItem(target))?;
                    let (parent, after) = self.restore_position(txn.store(), restored, target, parent);
                    restore_copy(txn, target, parent, after, restored)?;
                }
            }
            Change::Formatted { target, flag, previous } => {
                txn.format(self.resolve_in(restored, *target), *flag, *previous)?;
            }
            Change::Retyped { target, previous } => {
                txn.retype(self.resolve_in(restored, *target), previous.clone())?;
            }
        }
        Ok(())
    }
}

/// Insert a copy of `source` (and its live children) under `parent`.
fn restore_copy(
    txn: &mut LocalTxn<'_>,
    source: OpId,
    parent: Parent,
    after: Option<OpId>,
    restored: &mut Vec<(OpId, OpId)>,
) -> Result<OpId, StoreError> {
    let content = txn.store().content(source).ok_or(StoreError::UnknownItem(source))?;
    let is_element = matches!(content, Content::Element(_));
    let copy = txn.insert(parent, after, content)?;
    restored.push((source, copy));

    if is_element {
        let mut left = None;
        for child in txn.store().live_children(Parent::Item(source)) {
            left = Some(restore_copy(txn, child, Parent::Item(copy), left, restored)?);
        }
    }
    Ok(copy)
}

/// Drop inserts nested in another insert of the same batch; undoing the
/// outer one covers them.
fn collapse(store: &DocStore, changes: &[Change]) -> Vec<Change> {
    let inserted: HashSet<OpId> = changes
        .iter()
        .filter_map(|c| match c {
            Change::Inserted(id) => Some(*id),
            _ => None,
        })
        .collect();
    changes
        .iter()
        .filter(|c| match c {
            Change::Inserted(id) => match store.parent_of(*id) {
                Some(Parent::Item(parent)) => !inserted.contains(&parent),
                _ => true,
            },
            _ => true,
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ReplicaId;
    use vibedoc_core::{ElementKind, FormatFlag, TextFormat};

    fn type_paragraph(store: &mut DocStore, undo: &mut UndoManager, text: &str) -> Vec<OpId> {
        let committed = store.apply_local_delta(Origin::Local, |txn| {
            let p = txn.insert_element(Parent::Root, None, ElementKind::Paragraph)?;
            let mut left = None;
            let mut ids = vec![p];
            for ch in text.chars() {
                let id = txn.insert_char(Parent::Item(p), left, ch, TextFormat::PLAIN)?;
                ids.push(id);
                left = Some(id);
            }
            Ok(ids)
        });
        undo.record(store, &committed.changes, false);
        committed.result.unwrap()
    }

    #[test]
    fn test_undo_insert_then_redo() {
        let mut store = DocStore::new(ReplicaId(1));
        let mut undo = UndoManager::default();
        type_paragraph(&mut store, &mut undo, "hello");

        let committed = undo.undo(&mut store).unwrap();
        assert_eq!(committed.delta.len(), 1);
        assert!(store.is_empty());
        assert!(undo.can_redo());

        undo.redo(&mut store).unwrap();
        assert_eq!(store.text_content(), "hello");

        undo.undo(&mut store).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_undo_delete_restores_order() {
        let mut store = DocStore::new(ReplicaId(1));
        let mut undo = UndoManager::default();
        let ids = type_paragraph(&mut store, &mut undo, "abc");

        let committed = store.apply_local_delta(Origin::Local, |txn| {
            txn.delete(ids[2])?;
            txn.delete(ids[3])?;
            Ok(())
        });
        undo.record(&store, &committed.changes, false);
        assert_eq!(store.text_content(), "a");

        undo.undo(&mut store).unwrap();
        assert_eq!(store.text_content(), "abc");

        undo.redo(&mut store).unwrap();
        assert_eq!(store.text_content(), "a");
    }

    #[test]
    fn test_undo_restores_text_inside_restored_paragraph() {
        let mut store = DocStore::new(ReplicaId(1));
        let mut undo = UndoManager::default();
        let ids = type_paragraph(&mut store, &mut undo, "abc");

        let committed = store.apply_local_delta(Origin::Local, |txn| txn.delete(ids[2]));
        undo.record(&store, &committed.changes, false);
        let committed = store.apply_local_delta(Origin::Local, |txn| txn.delete(ids[0]));
        undo.record(&store, &committed.changes, false);
        assert!(store.is_empty());

        undo.undo(&mut store).unwrap();
        assert_eq!(store.text_content(), "ac");

        undo.undo(&mut store).unwrap();
        assert_eq!(store.text_content(), "abc");
        assert_eq!(store.live_children(Parent::Root).len(), 1);
    }

    #[test]
    fn test_undo_format_and_merge() {
        let mut store = DocStore::new(ReplicaId(1));
        let mut undo = UndoManager::default();
        let ids = type_paragraph(&mut store, &mut undo, "ab");

        for id in &ids[1..] {
            let committed = store.apply_local_delta(Origin::Local, |txn| txn.format(*id, FormatFlag::Bold, true));
            undo.record(&store, &committed.changes, true);
        }
        // Merged into the typing entry.
        undo.undo(&mut store).unwrap();
        assert!(store.is_empty());
        assert!(!undo.can_undo());
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut store = DocStore::new(ReplicaId(1));
        let mut undo = UndoManager::default();
        type_paragraph(&mut store, &mut undo, "x");
        undo.undo(&mut store).unwrap();
        assert!(undo.can_redo());

        type_paragraph(&mut store, &mut undo, "y");
        assert!(!undo.can_redo());
    }

    #[test]
    fn test_undo_leaves_remote_edits() {
        let mut local = DocStore::new(ReplicaId(1));
        let mut remote = DocStore::new(ReplicaId(2));
        let mut undo = UndoManager::default();

        let ids = type_paragraph(&mut local, &mut undo, "ab");
        remote.apply_delta(local.diff(remote.state_vector()));
        let committed = remote.apply_local_delta(Origin::Local, |txn| {
            txn.insert_char(Parent::Item(ids[0]), Some(ids[2]), '!', TextFormat::PLAIN)
        });
        local.apply_delta(committed.delta);

        let deleted = local.apply_local_delta(Origin::Local, |txn| txn.delete(ids[1]));
        undo.record(&local, &deleted.changes, false);
        assert_eq!(local.text_content(), "b!");

        undo.undo(&mut local).unwrap();
        assert_eq!(local.text_content(), "ab!");
    }
}
