//! Immutable editor state snapshots.
//!
//! An [`EditorState`] is a flat arena of nodes addressed by [`NodeKey`],
//! with parent/child relations stored as keys. Each committed update
//! transaction produces a new `EditorState` from the previous one.

use std::collections::HashMap;

use crate::node::{ElementKind, Node, NodeData, NodeKey, TextFormat};

/// A position in the tree: inside a text node (character offset) or
/// inside an element (child index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub key: NodeKey,
    pub offset: usize,
}

impl Point {
    pub fn new(key: NodeKey, offset: usize) -> Self {
        Self { key, offset }
    }
}

/// Anchor/focus selection. Collapsed when both points coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Selection {
    pub fn new(anchor: Point, focus: Point) -> Self {
        Self { anchor, focus }
    }

    pub fn collapsed(point: Point) -> Self {
        Self { anchor: point, focus: point }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}

/// One immutable snapshot of the document tree plus selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorState {
    pub(crate) nodes: HashMap<NodeKey, Node>,
    pub(crate) root: NodeKey,
    pub(crate) selection: Option<Selection>,
}

impl Default for EditorState {
    fn default() -> Self {
        Self::empty(NodeKey(0))
    }
}

impl EditorState {
    /// A state holding only an empty root under `root`.
    pub fn empty(root: NodeKey) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                key: root,
                parent: None,
                data: NodeData::Element(ElementKind::Root),
                children: Vec::new(),
            },
        );
        Self { nodes, root, selection: None }
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(&key)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(&key)
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the root has no children.
    pub fn is_empty(&self) -> bool {
        self.children(self.root).is_empty()
    }

    pub fn children(&self, key: NodeKey) -> &[NodeKey] {
        self.nodes.get(&key).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes.get(&key).and_then(|n| n.parent)
    }

    pub fn is_element(&self, key: NodeKey) -> bool {
        self.nodes.get(&key).map(|n| n.data.is_element()).unwrap_or(false)
    }

    pub fn is_text(&self, key: NodeKey) -> bool {
        self.nodes.get(&key).map(|n| n.data.is_text()).unwrap_or(false)
    }

    pub fn element_kind(&self, key: NodeKey) -> Option<&ElementKind> {
        self.nodes.get(&key).and_then(|n| n.element_kind())
    }

    pub fn text(&self, key: NodeKey) -> Option<&str> {
        self.nodes.get(&key).and_then(|n| n.text())
    }

    pub fn format(&self, key: NodeKey) -> Option<TextFormat> {
        self.nodes.get(&key).and_then(|n| n.format())
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Distance from the root (root = 0). Unknown keys report 0.
    pub fn depth(&self, key: NodeKey) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent(key);
        while let Some(k) = cursor {
            depth += 1;
            cursor = self.parent(k);
        }
        depth
    }

    /// Position of `key` among its parent's children.
    pub fn index_in_parent(&self, key: NodeKey) -> Option<usize> {
        let parent = self.parent(key)?;
        self.children(parent).iter().position(|k| *k == key)
    }

    /// Ancestors of `key`, nearest first, excluding `key` itself.
    pub fn ancestors(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut cursor = self.parent(key);
        while let Some(k) = cursor {
            out.push(k);
            cursor = self.parent(k);
        }
        out
    }

    /// Pre-order traversal starting at `key` (inclusive).
    pub fn descendants(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            if !self.contains(k) {
                continue;
            }
            out.push(k);
            for child in self.children(k).iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// All text of the document in reading order; top-level blocks are
    /// separated by newlines.
    pub fn text_content(&self) -> String {
        self.children(self.root)
            .iter()
            .map(|block| {
                self.descendants(*block)
                    .into_iter()
                    .filter_map(|k| self.text(k))
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Structural equality ignoring node keys and selection.
    pub fn same_content(&self, other: &EditorState) -> bool {
        fn eq(a: &EditorState, ak: NodeKey, b: &EditorState, bk: NodeKey) -> bool {
            let (Some(an), Some(bn)) = (a.node(ak), b.node(bk)) else {
                return false;
            };
            an.data == bn.data
                && an.children.len() == bn.children.len()
                && an
                    .children
                    .iter()
                    .zip(bn.children.iter())
                    .all(|(ac, bc)| eq(a, *ac, b, *bc))
        }
        eq(self, self.root, other, other.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EditorState {
        // root
        //  ├─ p(#1) ── "ab"(#2)
        //  └─ p(#3) ── "cd"(#4)
        let mut state = EditorState::empty(NodeKey(0));
        let mut add = |key: u32, parent: u32, data: NodeData| {
            state.nodes.insert(
                NodeKey(key),
                Node { key: NodeKey(key), parent: Some(NodeKey(parent)), data, children: vec![] },
            );
            state.nodes.get_mut(&NodeKey(parent)).unwrap().children.push(NodeKey(key));
        };
        add(1, 0, NodeData::Element(ElementKind::Paragraph));
        add(2, 1, NodeData::Text { text: "ab".into(), format: TextFormat::PLAIN });
        add(3, 0, NodeData::Element(ElementKind::Paragraph));
        add(4, 3, NodeData::Text { text: "cd".into(), format: TextFormat::PLAIN });
        state
    }

    #[test]
    fn test_empty_state() {
        let state = EditorState::default();
        assert!(state.is_empty());
        assert_eq!(state.len(), 1);
        assert_eq!(state.element_kind(state.root()), Some(&ElementKind::Root));
    }

    #[test]
    fn test_tree_queries() {
        let state = sample();
        assert_eq!(state.depth(NodeKey(4)), 2);
        assert_eq!(state.index_in_parent(NodeKey(3)), Some(1));
        assert_eq!(state.ancestors(NodeKey(2)), vec![NodeKey(1), NodeKey(0)]);
        assert_eq!(
            state.descendants(NodeKey(0)),
            vec![NodeKey(0), NodeKey(1), NodeKey(2), NodeKey(3), NodeKey(4)]
        );
    }

    #[test]
    fn test_text_content() {
        assert_eq!(sample().text_content(), "ab\ncd");
    }

    #[test]
    fn test_same_content_ignores_keys() {
        let a = sample();
        let mut b = sample();
        b.selection = Some(Selection::collapsed(Point::new(NodeKey(2), 1)));
        assert!(a.same_content(&b));

        if let Some(node) = b.nodes.get_mut(&NodeKey(4)) {
            node.data = NodeData::Text { text: "cx".into(), format: TextFormat::PLAIN };
        }
        assert!(!a.same_content(&b));
    }
}
