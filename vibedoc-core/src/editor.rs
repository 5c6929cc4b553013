//! The editor: owns the current [`EditorState`] and runs update
//! transactions against it.
//!
//! ```text
//!  editor.update(tags, |txn| { … })
//!        │
//!        ▼
//!  draft = clone(prev) ── mutations mark dirty keys
//!        │
//!        ▼
//!  commit: sweep detached nodes, relocate selection
//!        │
//!        ▼
//!  UpdateEvent { prev_state, state, dirty_elements, dirty_leaves, tags }
//!        │
//!        ▼
//!  update listeners (e.g. the collaboration binding)
//! ```
//!
//! Transactions run to completion; a failed closure discards the draft.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::events::{Observers, Subscription};
use crate::node::{ElementKind, FormatFlag, Node, NodeData, NodeKey, TextFormat};
use crate::state::{EditorState, Point, Selection};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditorError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeKey),
    #[error("Node {0} is not an element")]
    NotAnElement(NodeKey),
    #[error("Node {0} is not a text node")]
    NotText(NodeKey),
    #[error("The root node cannot be removed, moved or retyped")]
    RootImmutable,
    #[error("Cannot attach {child} under its own descendant {parent}")]
    Cycle { parent: NodeKey, child: NodeKey },
    #[error("Offset {offset} out of range for {key} (len {len})")]
    OffsetOutOfRange { key: NodeKey, offset: usize, len: usize },
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Origin / intent markers attached to an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdateTag {
    /// Never forwarded to the shared document.
    SkipCollab,
    /// Produced by applying remote shared-document changes.
    Collaboration,
    /// Folded into the previous history step.
    HistoryMerge,
    /// Produced by undo/redo.
    Historic,
}

/// Emitted after every committed transaction that changed something.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub prev_state: Arc<EditorState>,
    pub state: Arc<EditorState>,
    pub dirty_elements: BTreeSet<NodeKey>,
    pub dirty_leaves: BTreeSet<NodeKey>,
    pub tags: BTreeSet<UpdateTag>,
}

impl UpdateEvent {
    pub fn has_tag(&self, tag: UpdateTag) -> bool {
        self.tags.contains(&tag)
    }

    /// True when no node changed (selection-only update).
    pub fn is_selection_only(&self) -> bool {
        self.dirty_elements.is_empty() && self.dirty_leaves.is_empty()
    }
}

/// Owns the current editor state and its update listeners.
pub struct Editor {
    state: Arc<EditorState>,
    next_key: u32,
    listeners: Observers<UpdateEvent>,
}

impl Default for Editor {
    fn default() -> Self {
        Self::new()
    }
}

impl Editor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EditorState::empty(NodeKey(0))),
            next_key: 1,
            listeners: Observers::new(),
        }
    }

    /// Current committed state.
    pub fn state(&self) -> &Arc<EditorState> {
        &self.state
    }

    /// Register a listener invoked after each committed update.
    pub fn register_update_listener(
        &self,
        listener: impl FnMut(&UpdateEvent) + Send + 'static,
    ) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Run `f` as one atomic update transaction.
    ///
    /// On error the draft is discarded and no event is emitted.
    pub fn update<R>(
        &mut self,
        tags: &[UpdateTag],
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, EditorError>,
    ) -> Result<R, EditorError> {
        let prev = self.state.clone();
        let mut txn = Transaction {
            draft: (*prev).clone(),
            next_key: &mut self.next_key,
            dirty_elements: BTreeSet::new(),
            dirty_leaves: BTreeSet::new(),
        };

        let result = f(&mut txn)?;

        let Transaction { mut draft, mut dirty_elements, mut dirty_leaves, .. } = txn;
        sweep_detached(&mut draft);
        dirty_elements.retain(|k| draft.contains(*k));
        dirty_leaves.retain(|k| draft.contains(*k));
        relocate_selection(&prev, &mut draft);

        if dirty_elements.is_empty() && dirty_leaves.is_empty() && draft.selection == prev.selection {
            return Ok(result);
        }

        let state = Arc::new(draft);
        self.state = state.clone();

        let event = UpdateEvent {
            prev_state: prev,
            state,
            dirty_elements,
            dirty_leaves,
            tags: tags.iter().copied().collect(),
        };
        self.listeners.emit(&event);
        Ok(result)
    }
}

/// Remove every node not reachable from the root.
fn sweep_detached(state: &mut EditorState) {
    let reachable: HashSet<NodeKey> = state.descendants(state.root).into_iter().collect();
    if reachable.len() != state.nodes.len() {
        state.nodes.retain(|k, _| reachable.contains(k));
    }
}

fn relocate_selection(prev: &EditorState, next: &mut EditorState) {
    let Some(selection) = next.selection else {
        return;
    };
    let anchor = relocate_point(prev, next, selection.anchor);
    let focus = relocate_point(prev, next, selection.focus);
    next.selection = Some(Selection::new(anchor, focus));
}

/// Keep `point` valid in `next`: clamp offsets of surviving nodes, move
/// points on removed nodes to the nearest surviving ancestor.
fn relocate_point(prev: &EditorState, next: &EditorState, point: Point) -> Point {
    if let Some(node) = next.node(point.key) {
        let max = match &node.data {
            NodeData::Text { .. } => node.text_len(),
            NodeData::Element(_) => node.children.len(),
        };
        return Point::new(point.key, point.offset.min(max));
    }

    let mut child = point.key;
    let mut cursor = prev.parent(point.key);
    while let Some(ancestor) = cursor {
        if next.is_element(ancestor) {
            let index = prev
                .index_in_parent(child)
                .unwrap_or(0)
                .min(next.children(ancestor).len());
            log::warn!(
                "Selection anchored to removed node {}; relocated to ancestor {} at {}",
                point.key,
                ancestor,
                index
            );
            return Point::new(ancestor, index);
        }
        child = ancestor;
        cursor = prev.parent(ancestor);
    }

    log::warn!("Selection anchored to unknown node {}; relocated to root", point.key);
    Point::new(next.root, 0)
}

fn byte_offset(text: &str, offset: usize) -> Option<usize> {
    if offset == text.chars().count() {
        return Some(text.len());
    }
    text.char_indices().nth(offset).map(|(i, _)| i)
}

/// Mutable draft of one update. Obtained through [`Editor::update`].
pub struct Transaction<'a> {
    draft: EditorState,
    next_key: &'a mut u32,
    dirty_elements: BTreeSet<NodeKey>,
    dirty_leaves: BTreeSet<NodeKey>,
}

impl<'a> Transaction<'a> {
    /// The draft as mutated so far.
    pub fn state(&self) -> &EditorState {
        &self.draft
    }

    pub fn root(&self) -> NodeKey {
        self.draft.root
    }

    fn allocate(&mut self) -> NodeKey {
        let key = NodeKey(*self.next_key);
        *self.next_key += 1;
        key
    }

    fn mark(&mut self, key: NodeKey) {
        match self.draft.node(key).map(|n| n.data.is_element()) {
            Some(true) => {
                self.dirty_elements.insert(key);
            }
            Some(false) => {
                self.dirty_leaves.insert(key);
                if let Some(parent) = self.draft.parent(key) {
                    self.dirty_elements.insert(parent);
                }
            }
            None => {}
        }
    }

    fn node_mut(&mut self, key: NodeKey) -> Result<&mut Node, EditorError> {
        self.draft.nodes.get_mut(&key).ok_or(EditorError::UnknownNode(key))
    }

    fn require_element(&self, key: NodeKey) -> Result<(), EditorError> {
        match self.draft.node(key) {
            None => Err(EditorError::UnknownNode(key)),
            Some(n) if n.data.is_element() => Ok(()),
            Some(_) => Err(EditorError::NotAnElement(key)),
        }
    }

    /// Create a detached element. It is discarded at commit unless attached.
    pub fn create_element(&mut self, kind: ElementKind) -> Result<NodeKey, EditorError> {
        if kind.is_root() {
            return Err(EditorError::RootImmutable);
        }
        let key = self.allocate();
        self.draft.nodes.insert(
            key,
            Node { key, parent: None, data: NodeData::Element(kind), children: Vec::new() },
        );
        self.dirty_elements.insert(key);
        Ok(key)
    }

    /// Create a detached text node.
    pub fn create_text(&mut self, text: impl Into<String>, format: TextFormat) -> NodeKey {
        let key = self.allocate();
        self.draft.nodes.insert(
            key,
            Node {
                key,
                parent: None,
                data: NodeData::Text { text: text.into(), format },
                children: Vec::new(),
            },
        );
        self.dirty_leaves.insert(key);
        key
    }

    /// Attach `child` under `parent` at `index`, detaching it from its
    /// current parent first.
    pub fn insert_at(&mut self, parent: NodeKey, index: usize, child: NodeKey) -> Result<(), EditorError> {
        self.require_element(parent)?;
        if child == self.draft.root {
            return Err(EditorError::RootImmutable);
        }
        if !self.draft.contains(child) {
            return Err(EditorError::UnknownNode(child));
        }
        if parent == child || self.draft.ancestors(parent).contains(&child) {
            return Err(EditorError::Cycle { parent, child });
        }

        self.detach(child)?;
        let len = self.draft.children(parent).len();
        if index > len {
            return Err(EditorError::OffsetOutOfRange { key: parent, offset: index, len });
        }
        self.node_mut(parent)?.children.insert(index, child);
        self.node_mut(child)?.parent = Some(parent);
        self.dirty_elements.insert(parent);
        self.mark(child);
        Ok(())
    }

    pub fn append(&mut self, parent: NodeKey, child: NodeKey) -> Result<(), EditorError> {
        let index = self.draft.children(parent).len();
        // Re-appending an existing child of `parent` shifts the end by one.
        let index = if self.draft.parent(child) == Some(parent) { index - 1 } else { index };
        self.insert_at(parent, index, child)
    }

    /// Create an element and append it under `parent`.
    pub fn append_element(&mut self, parent: NodeKey, kind: ElementKind) -> Result<NodeKey, EditorError> {
        self.require_element(parent)?;
        let key = self.create_element(kind)?;
        self.append(parent, key)?;
        Ok(key)
    }

    /// Create a text node and append it under `parent`.
    pub fn append_text(
        &mut self,
        parent: NodeKey,
        text: impl Into<String>,
        format: TextFormat,
    ) -> Result<NodeKey, EditorError> {
        self.require_element(parent)?;
        let key = self.create_text(text, format);
        self.append(parent, key)?;
        Ok(key)
    }

    fn detach(&mut self, key: NodeKey) -> Result<(), EditorError> {
        if let Some(parent) = self.draft.parent(key) {
            self.node_mut(parent)?.children.retain(|k| *k != key);
            self.node_mut(key)?.parent = None;
            self.dirty_elements.insert(parent);
        }
        Ok(())
    }

    /// Remove `key` and its subtree from the document.
    pub fn remove(&mut self, key: NodeKey) -> Result<(), EditorError> {
        if key == self.draft.root {
            return Err(EditorError::RootImmutable);
        }
        if !self.draft.contains(key) {
            return Err(EditorError::UnknownNode(key));
        }
        self.detach(key)
    }

    /// Replace the child list of `parent`. Previous children not in
    /// `children` are removed from the document.
    pub fn set_children(&mut self, parent: NodeKey, children: Vec<NodeKey>) -> Result<(), EditorError> {
        self.require_element(parent)?;
        if self.draft.children(parent) == children.as_slice() {
            return Ok(());
        }
        for child in self.draft.children(parent).to_vec() {
            self.detach(child)?;
        }
        for (index, child) in children.into_iter().enumerate() {
            self.insert_at(parent, index, child)?;
        }
        self.dirty_elements.insert(parent);
        Ok(())
    }

    /// Remove all content under the root.
    pub fn clear_root(&mut self) -> Result<(), EditorError> {
        let root = self.draft.root;
        self.set_children(root, Vec::new())
    }

    fn text_mut(&mut self, key: NodeKey) -> Result<(&mut String, &mut TextFormat), EditorError> {
        match &mut self.node_mut(key)?.data {
            NodeData::Text { text, format } => Ok((text, format)),
            NodeData::Element(_) => Err(EditorError::NotText(key)),
        }
    }

    pub fn set_text(&mut self, key: NodeKey, value: impl Into<String>) -> Result<(), EditorError> {
        let value = value.into();
        let (text, _) = self.text_mut(key)?;
        if *text != value {
            *text = value;
            self.mark(key);
        }
        Ok(())
    }

    /// Insert `value` at character `offset`.
    pub fn insert_text(&mut self, key: NodeKey, offset: usize, value: &str) -> Result<(), EditorError> {
        let (text, _) = self.text_mut(key)?;
        let len = text.chars().count();
        let at = byte_offset(text, offset).ok_or(EditorError::OffsetOutOfRange { key, offset, len })?;
        text.insert_str(at, value);
        self.mark(key);
        Ok(())
    }

    /// Delete `count` characters starting at character `offset`.
    pub fn delete_text(&mut self, key: NodeKey, offset: usize, count: usize) -> Result<(), EditorError> {
        let (text, _) = self.text_mut(key)?;
        let len = text.chars().count();
        let end = offset + count;
        let (Some(start), Some(stop)) = (byte_offset(text, offset), byte_offset(text, end)) else {
            return Err(EditorError::OffsetOutOfRange { key, offset: end, len });
        };
        text.replace_range(start..stop, "");
        self.mark(key);
        Ok(())
    }

    pub fn set_format(&mut self, key: NodeKey, flag: FormatFlag, value: bool) -> Result<(), EditorError> {
        let (_, format) = self.text_mut(key)?;
        if format.get(flag) != value {
            format.set(flag, value);
            self.mark(key);
        }
        Ok(())
    }

    pub fn toggle_format(&mut self, key: NodeKey, flag: FormatFlag) -> Result<(), EditorError> {
        let current = self.draft.format(key).ok_or(EditorError::NotText(key))?;
        self.set_format(key, flag, !current.get(flag))
    }

    pub fn set_text_format(&mut self, key: NodeKey, value: TextFormat) -> Result<(), EditorError> {
        let (_, format) = self.text_mut(key)?;
        if *format != value {
            *format = value;
            self.mark(key);
        }
        Ok(())
    }

    /// Change an element's type in place, keeping its children
    /// (paragraph ⇄ heading ⇄ list conversions).
    pub fn set_element_kind(&mut self, key: NodeKey, kind: ElementKind) -> Result<(), EditorError> {
        if key == self.draft.root || kind.is_root() {
            return Err(EditorError::RootImmutable);
        }
        let changed = match &mut self.node_mut(key)?.data {
            NodeData::Element(current) if *current != kind => {
                *current = kind;
                true
            }
            NodeData::Element(_) => false,
            NodeData::Text { .. } => return Err(EditorError::NotAnElement(key)),
        };
        if changed {
            self.dirty_elements.insert(key);
        }
        Ok(())
    }

    /// Replace the selection. Points must reference existing nodes.
    pub fn set_selection(&mut self, selection: Option<Selection>) -> Result<(), EditorError> {
        if let Some(sel) = &selection {
            for point in [sel.anchor, sel.focus] {
                if !self.draft.contains(point.key) {
                    return Err(EditorError::UnknownNode(point.key));
                }
            }
        }
        self.draft.selection = selection;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn paragraph_with(editor: &mut Editor, text: &str) -> (NodeKey, NodeKey) {
        editor
            .update(&[], |txn| {
                let root = txn.root();
                let p = txn.append_element(root, ElementKind::Paragraph)?;
                let t = txn.append_text(p, text, TextFormat::PLAIN)?;
                Ok((p, t))
            })
            .unwrap()
    }

    #[test]
    fn test_update_builds_tree() {
        let mut editor = Editor::new();
        let (p, t) = paragraph_with(&mut editor, "hello");
        let state = editor.state();
        assert_eq!(state.children(state.root()), &[p]);
        assert_eq!(state.text(t), Some("hello"));
        assert_eq!(state.parent(t), Some(p));
    }

    #[test]
    fn test_failed_update_discards_draft() {
        let mut editor = Editor::new();
        let before = editor.state().clone();
        let result = editor.update(&[], |txn| {
            let root = txn.root();
            txn.append_element(root, ElementKind::Paragraph)?;
            txn.remove(root)
        });
        assert_eq!(result, Err(EditorError::RootImmutable));
        assert!(Arc::ptr_eq(&before, editor.state()));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut editor = Editor::new();
        let (p, t) = paragraph_with(&mut editor, "abc");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = editor.register_update_listener(move |e| sink.lock().unwrap().push(e.clone()));

        editor
            .update(&[UpdateTag::HistoryMerge], |txn| txn.insert_text(t, 1, "X"))
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.dirty_leaves.contains(&t));
        assert!(event.dirty_elements.contains(&p));
        assert!(event.has_tag(UpdateTag::HistoryMerge));
        assert_eq!(event.prev_state.text(t), Some("abc"));
        assert_eq!(event.state.text(t), Some("aXbc"));
    }

    #[test]
    fn test_noop_update_emits_nothing() {
        let mut editor = Editor::new();
        let (_, t) = paragraph_with(&mut editor, "same");
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let _sub = editor.register_update_listener(move |_| *c.lock().unwrap() += 1);

        editor.update(&[], |txn| txn.set_text(t, "same")).unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn test_text_editing_unicode() {
        let mut editor = Editor::new();
        let (_, t) = paragraph_with(&mut editor, "héllo");
        editor
            .update(&[], |txn| {
                txn.delete_text(t, 1, 1)?;
                txn.insert_text(t, 5, "!")
            })
            .unwrap_err();
        editor
            .update(&[], |txn| {
                txn.delete_text(t, 1, 1)?;
                txn.insert_text(t, 4, "!")
            })
            .unwrap();
        assert_eq!(editor.state().text(t), Some("hllo!"));
    }

    #[test]
    fn test_remove_sweeps_subtree() {
        let mut editor = Editor::new();
        let (p, t) = paragraph_with(&mut editor, "gone");
        editor.update(&[], |txn| txn.remove(p)).unwrap();
        assert!(!editor.state().contains(p));
        assert!(!editor.state().contains(t));
        assert_eq!(editor.state().len(), 1);
    }

    #[test]
    fn test_selection_relocates_to_surviving_ancestor() {
        let mut editor = Editor::new();
        let (list, item, text) = editor
            .update(&[], |txn| {
                let root = txn.root();
                txn.append_element(root, ElementKind::Paragraph)?;
                let list = txn.append_element(root, ElementKind::List(crate::ListKind::Bullet))?;
                let item = txn.append_element(list, ElementKind::ListItem)?;
                let text = txn.append_text(item, "item", TextFormat::PLAIN)?;
                Ok((list, item, text))
            })
            .unwrap();
        editor
            .update(&[], |txn| txn.set_selection(Some(Selection::collapsed(Point::new(text, 2)))))
            .unwrap();

        editor.update(&[], |txn| txn.remove(item)).unwrap();

        let selection = editor.state().selection().copied().unwrap();
        assert_eq!(selection.anchor, Point::new(list, 0));
        assert!(editor.state().contains(selection.focus.key));
    }

    #[test]
    fn test_selection_offset_clamped() {
        let mut editor = Editor::new();
        let (_, t) = paragraph_with(&mut editor, "abcdef");
        editor
            .update(&[], |txn| txn.set_selection(Some(Selection::collapsed(Point::new(t, 6)))))
            .unwrap();
        editor.update(&[], |txn| txn.delete_text(t, 2, 4)).unwrap();
        assert_eq!(editor.state().selection().unwrap().anchor, Point::new(t, 2));
    }

    #[test]
    fn test_set_element_kind_keeps_children() {
        let mut editor = Editor::new();
        let (p, t) = paragraph_with(&mut editor, "title");
        let heading = ElementKind::Heading(crate::HeadingLevel::H1);
        editor.update(&[], |txn| txn.set_element_kind(p, heading.clone())).unwrap();
        assert_eq!(editor.state().element_kind(p), Some(&heading));
        assert_eq!(editor.state().children(p), &[t]);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut editor = Editor::new();
        let (p, _) = paragraph_with(&mut editor, "x");
        let result = editor.update(&[], |txn| {
            let inner = txn.append_element(p, ElementKind::ListItem)?;
            txn.append(inner, p)
        });
        assert_eq!(result, Err(EditorError::Cycle { parent: NodeKey(3), child: p }));
    }

    #[test]
    fn test_set_children_reorders() {
        let mut editor = Editor::new();
        let (a, _) = paragraph_with(&mut editor, "a");
        let (b, _) = paragraph_with(&mut editor, "b");
        editor
            .update(&[], |txn| {
                let root = txn.root();
                txn.set_children(root, vec![b, a])
            })
            .unwrap();
        assert_eq!(editor.state().text_content(), "b\na");
    }
}
