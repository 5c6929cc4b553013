//! Node kinds of the local editable document tree.
//!
//! Nodes form a closed set of variants. Element nodes own ordered children,
//! text nodes own a run of literal characters sharing one [`TextFormat`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-local node key. Opaque and not stable across reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub u32);

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Heading levels h1 through h5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HeadingLevel {
    H1,
    H2,
    H3,
    H4,
    H5,
}

impl HeadingLevel {
    /// Parse a numeric level (1..=5).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::H1),
            2 => Some(Self::H2),
            3 => Some(Self::H3),
            4 => Some(Self::H4),
            5 => Some(Self::H5),
            _ => None,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Self::H1 => 1,
            Self::H2 => 2,
            Self::H3 => 3,
            Self::H4 => 4,
            Self::H5 => 5,
        }
    }

    /// HTML-style tag, e.g. `"h2"`.
    pub fn tag(&self) -> String {
        format!("h{}", self.level())
    }

    /// Parse an HTML-style tag (`"h1"`..`"h5"`).
    pub fn from_tag(tag: &str) -> Option<Self> {
        tag.strip_prefix('h')
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(Self::from_level)
    }
}

/// Bullet or numbered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ListKind {
    Bullet,
    Number,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullet => "bullet",
            Self::Number => "number",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bullet" => Some(Self::Bullet),
            "number" => Some(Self::Number),
            _ => None,
        }
    }
}

/// Element node type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementKind {
    Root,
    Paragraph,
    Heading(HeadingLevel),
    List(ListKind),
    ListItem,
    /// Application-defined block (e.g. a banner), identified by name.
    Custom(String),
}

impl ElementKind {
    /// Lexical-compatible `type` string.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Root => "root",
            Self::Paragraph => "paragraph",
            Self::Heading(_) => "heading",
            Self::List(_) => "list",
            Self::ListItem => "listitem",
            Self::Custom(_) => "custom",
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }
}

/// Independent inline format flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FormatFlag {
    Bold,
    Italic,
    Underline,
}

impl FormatFlag {
    pub const ALL: [FormatFlag; 3] = [FormatFlag::Bold, FormatFlag::Italic, FormatFlag::Underline];

    /// Bit used in the serialized `format` bitmask (Lexical layout).
    pub fn bit(&self) -> u8 {
        match self {
            Self::Bold => 1,
            Self::Italic => 2,
            Self::Underline => 8,
        }
    }

    /// Dense index, used by per-flag tables.
    pub fn index(&self) -> usize {
        match self {
            Self::Bold => 0,
            Self::Italic => 1,
            Self::Underline => 2,
        }
    }
}

/// Combination of format flags applied to a text run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextFormat {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl TextFormat {
    pub const PLAIN: TextFormat = TextFormat { bold: false, italic: false, underline: false };

    pub fn get(&self, flag: FormatFlag) -> bool {
        match flag {
            FormatFlag::Bold => self.bold,
            FormatFlag::Italic => self.italic,
            FormatFlag::Underline => self.underline,
        }
    }

    pub fn set(&mut self, flag: FormatFlag, value: bool) {
        match flag {
            FormatFlag::Bold => self.bold = value,
            FormatFlag::Italic => self.italic = value,
            FormatFlag::Underline => self.underline = value,
        }
    }

    /// Builder-style variant of [`TextFormat::set`].
    pub fn with(mut self, flag: FormatFlag, value: bool) -> Self {
        self.set(flag, value);
        self
    }

    pub fn to_bits(&self) -> u8 {
        FormatFlag::ALL
            .iter()
            .filter(|f| self.get(**f))
            .fold(0, |bits, f| bits | f.bit())
    }

    pub fn from_bits(bits: u8) -> Self {
        let mut format = Self::PLAIN;
        for flag in FormatFlag::ALL {
            format.set(flag, bits & flag.bit() != 0);
        }
        format
    }

    /// Flags whose value differs between `self` and `other`.
    pub fn diff(&self, other: &TextFormat) -> Vec<FormatFlag> {
        FormatFlag::ALL
            .into_iter()
            .filter(|f| self.get(*f) != other.get(*f))
            .collect()
    }
}

/// Kind-specific payload of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeData {
    Element(ElementKind),
    Text { text: String, format: TextFormat },
}

impl NodeData {
    pub fn is_element(&self) -> bool {
        matches!(self, NodeData::Element(_))
    }

    pub fn is_text(&self) -> bool {
        matches!(self, NodeData::Text { .. })
    }
}

/// A node stored in the editor arena. Relations are key references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub key: NodeKey,
    pub parent: Option<NodeKey>,
    pub data: NodeData,
    pub children: Vec<NodeKey>,
}

impl Node {
    pub fn element_kind(&self) -> Option<&ElementKind> {
        match &self.data {
            NodeData::Element(kind) => Some(kind),
            NodeData::Text { .. } => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.data {
            NodeData::Text { text, .. } => Some(text),
            NodeData::Element(_) => None,
        }
    }

    pub fn format(&self) -> Option<TextFormat> {
        match &self.data {
            NodeData::Text { format, .. } => Some(*format),
            NodeData::Element(_) => None,
        }
    }

    /// Length in characters for text nodes, zero for elements.
    pub fn text_len(&self) -> usize {
        self.text().map(|t| t.chars().count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heading_tag_roundtrip() {
        for level in 1..=5 {
            let heading = HeadingLevel::from_level(level).unwrap();
            assert_eq!(HeadingLevel::from_tag(&heading.tag()), Some(heading));
        }
        assert!(HeadingLevel::from_level(6).is_none());
        assert!(HeadingLevel::from_tag("p").is_none());
    }

    #[test]
    fn test_format_bits() {
        let format = TextFormat::PLAIN
            .with(FormatFlag::Bold, true)
            .with(FormatFlag::Underline, true);
        assert_eq!(format.to_bits(), 9);
        assert_eq!(TextFormat::from_bits(9), format);
        assert_eq!(TextFormat::from_bits(0), TextFormat::PLAIN);
    }

    #[test]
    fn test_format_diff() {
        let a = TextFormat::PLAIN.with(FormatFlag::Bold, true);
        let b = TextFormat::PLAIN.with(FormatFlag::Italic, true);
        assert_eq!(a.diff(&b), vec![FormatFlag::Bold, FormatFlag::Italic]);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn test_text_len_counts_chars() {
        let node = Node {
            key: NodeKey(1),
            parent: None,
            data: NodeData::Text { text: "héllo".into(), format: TextFormat::PLAIN },
            children: vec![],
        };
        assert_eq!(node.text_len(), 5);
    }
}
