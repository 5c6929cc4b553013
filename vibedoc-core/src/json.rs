//! Lexical-compatible JSON import/export of editor states.
//!
//! ```json
//! {"root":{"type":"root","version":1,"children":[
//!   {"type":"heading","tag":"h1","version":1,"children":[
//!     {"type":"text","text":"Title","format":1,"version":1}]}]}}
//! ```
//!
//! Element-level `format` values (alignment strings) are accepted and
//! ignored. Unknown element types round-trip as [`ElementKind::Custom`].

use serde::{Deserialize, Serialize};

use crate::editor::{Editor, EditorError, Transaction, UpdateTag};
use crate::node::{ElementKind, HeadingLevel, ListKind, NodeData, NodeKey, TextFormat};
use crate::state::EditorState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEditorState {
    pub root: SerializedNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormatField {
    Bits(u8),
    Alignment(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedNode {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<SerializedNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_type: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl SerializedNode {
    fn element(node_type: impl Into<String>, children: Vec<SerializedNode>) -> Self {
        Self {
            node_type: node_type.into(),
            version: 1,
            children: Some(children),
            text: None,
            format: None,
            tag: None,
            list_type: None,
        }
    }

    pub fn text(text: impl Into<String>, format: TextFormat) -> Self {
        Self {
            node_type: "text".to_string(),
            version: 1,
            children: None,
            text: Some(text.into()),
            format: Some(FormatField::Bits(format.to_bits())),
            tag: None,
            list_type: None,
        }
    }

    pub fn paragraph(children: Vec<SerializedNode>) -> Self {
        Self::element("paragraph", children)
    }

    pub fn heading(level: HeadingLevel, children: Vec<SerializedNode>) -> Self {
        let mut node = Self::element("heading", children);
        node.tag = Some(level.tag());
        node
    }

    pub fn list(kind: ListKind, items: Vec<SerializedNode>) -> Self {
        let mut node = Self::element("list", items);
        node.list_type = Some(kind.as_str().to_string());
        node
    }

    pub fn list_item(children: Vec<SerializedNode>) -> Self {
        Self::element("listitem", children)
    }

    /// Element kind encoded by this node, `None` for text nodes.
    pub fn element_kind(&self) -> Result<Option<ElementKind>, EditorError> {
        let kind = match self.node_type.as_str() {
            "text" => return Ok(None),
            "root" => ElementKind::Root,
            "paragraph" => ElementKind::Paragraph,
            "listitem" => ElementKind::ListItem,
            "heading" => {
                let tag = self.tag.as_deref().unwrap_or("h1");
                let level = HeadingLevel::from_tag(tag).ok_or_else(|| {
                    EditorError::InvalidSnapshot(format!("unsupported heading tag {tag:?}"))
                })?;
                ElementKind::Heading(level)
            }
            "list" => {
                let list_type = self.list_type.as_deref().unwrap_or("bullet");
                let kind = ListKind::parse(list_type).ok_or_else(|| {
                    EditorError::InvalidSnapshot(format!("unsupported list type {list_type:?}"))
                })?;
                ElementKind::List(kind)
            }
            other => ElementKind::Custom(other.to_string()),
        };
        Ok(Some(kind))
    }

    fn text_format(&self) -> TextFormat {
        match &self.format {
            Some(FormatField::Bits(bits)) => TextFormat::from_bits(*bits),
            _ => TextFormat::PLAIN,
        }
    }
}

fn element_node(kind: &ElementKind, children: Vec<SerializedNode>) -> SerializedNode {
    match kind {
        ElementKind::Root => SerializedNode::element("root", children),
        ElementKind::Paragraph => SerializedNode::paragraph(children),
        ElementKind::Heading(level) => SerializedNode::heading(*level, children),
        ElementKind::List(list) => SerializedNode::list(*list, children),
        ElementKind::ListItem => SerializedNode::list_item(children),
        ElementKind::Custom(name) => SerializedNode::element(name.clone(), children),
    }
}

impl EditorState {
    /// Serialize the subtree under `key`.
    pub fn serialize_node(&self, key: NodeKey) -> Option<SerializedNode> {
        let node = self.node(key)?;
        Some(match &node.data {
            NodeData::Text { text, format } => SerializedNode::text(text.clone(), *format),
            NodeData::Element(kind) => {
                let children = node
                    .children
                    .iter()
                    .filter_map(|child| self.serialize_node(*child))
                    .collect();
                element_node(kind, children)
            }
        })
    }

    pub fn to_serialized(&self) -> SerializedEditorState {
        let root = self
            .serialize_node(self.root())
            .unwrap_or_else(|| SerializedNode::element("root", Vec::new()));
        SerializedEditorState { root }
    }

    pub fn to_json(&self) -> Result<String, EditorError> {
        serde_json::to_string(&self.to_serialized())
            .map_err(|e| EditorError::InvalidSnapshot(e.to_string()))
    }
}

impl Transaction<'_> {
    /// Build `node` (recursively) and append it under `parent`.
    pub fn import_node(&mut self, parent: NodeKey, node: &SerializedNode) -> Result<NodeKey, EditorError> {
        let key = match node.element_kind()? {
            None => {
                let text = node.text.clone().unwrap_or_default();
                self.create_text(text, node.text_format())
            }
            Some(ElementKind::Root) => {
                return Err(EditorError::InvalidSnapshot("nested root node".to_string()));
            }
            Some(kind) => {
                let key = self.create_element(kind)?;
                for child in node.children.iter().flatten() {
                    self.import_node(key, child)?;
                }
                key
            }
        };
        self.append(parent, key)?;
        Ok(key)
    }

    /// Replace the whole document with `serialized`.
    pub fn set_serialized_state(&mut self, serialized: &SerializedEditorState) -> Result<(), EditorError> {
        if serialized.root.node_type != "root" {
            return Err(EditorError::InvalidSnapshot(format!(
                "expected root node, found {:?}",
                serialized.root.node_type
            )));
        }
        self.clear_root()?;
        let root = self.root();
        for child in serialized.root.children.iter().flatten() {
            self.import_node(root, child)?;
        }
        Ok(())
    }
}

impl Editor {
    pub fn parse_json(json: &str) -> Result<SerializedEditorState, EditorError> {
        serde_json::from_str(json).map_err(|e| EditorError::InvalidSnapshot(e.to_string()))
    }

    /// Replace the document with a serialized JSON state.
    pub fn set_json(&mut self, json: &str, tags: &[UpdateTag]) -> Result<(), EditorError> {
        let serialized = Self::parse_json(json)?;
        self.update(tags, |txn| txn.set_serialized_state(&serialized))
    }

    pub fn to_json(&self) -> Result<String, EditorError> {
        self.state().to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FormatFlag;

    const DOC: &str = r#"{"root":{"type":"root","format":"","version":1,"children":[
        {"type":"heading","tag":"h2","format":"","version":1,"children":[
            {"type":"text","text":"Title","format":1,"version":1}]},
        {"type":"paragraph","version":1,"children":[
            {"type":"text","text":"plain ","format":0,"version":1},
            {"type":"text","text":"loud","format":11,"version":1}]},
        {"type":"list","listType":"number","version":1,"children":[
            {"type":"listitem","version":1,"children":[
                {"type":"text","text":"one","format":0,"version":1}]}]},
        {"type":"banner","version":1,"children":[]}]}}"#;

    #[test]
    fn test_import_lexical_json() {
        let mut editor = Editor::new();
        editor.set_json(DOC, &[]).unwrap();
        let state = editor.state();
        let blocks = state.children(state.root()).to_vec();
        assert_eq!(blocks.len(), 4);
        assert_eq!(state.element_kind(blocks[0]), Some(&ElementKind::Heading(HeadingLevel::H2)));
        assert_eq!(state.element_kind(blocks[2]), Some(&ElementKind::List(ListKind::Number)));
        assert_eq!(state.element_kind(blocks[3]), Some(&ElementKind::Custom("banner".into())));

        let loud = state.children(blocks[1])[1];
        let format = state.format(loud).unwrap();
        assert!(format.get(FormatFlag::Bold) && format.get(FormatFlag::Italic) && format.get(FormatFlag::Underline));
        assert_eq!(state.text_content(), "Title\nplain loud\none\n");
    }

    #[test]
    fn test_export_then_import_preserves_content() {
        let mut editor = Editor::new();
        editor.set_json(DOC, &[]).unwrap();
        let json = editor.to_json().unwrap();

        let mut other = Editor::new();
        other.set_json(&json, &[]).unwrap();
        assert!(editor.state().same_content(other.state()));
    }

    #[test]
    fn test_rejects_bad_heading() {
        let json = r#"{"root":{"type":"root","children":[{"type":"heading","tag":"h9","children":[]}]}}"#;
        let mut editor = Editor::new();
        assert!(matches!(editor.set_json(json, &[]), Err(EditorError::InvalidSnapshot(_))));
        assert!(editor.state().is_empty());
    }

    #[test]
    fn test_rejects_non_root_top_level() {
        let json = r#"{"root":{"type":"paragraph","children":[]}}"#;
        assert!(Editor::new().set_json(json, &[]).is_err());
    }
}
