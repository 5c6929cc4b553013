//! # vibedoc-core — Local document model for Vibedoc
//!
//! A keyed rich-text tree (root → blocks → inline text runs) edited
//! through atomic update transactions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  update(tags, f)   ┌──────────────┐
//! │   Editor    │ ─────────────────► │ Transaction  │
//! │             │                    │ (draft tree) │
//! └──────┬──────┘                    └──────┬───────┘
//!        │ commit                           │
//!        ▼                                  │
//! ┌─────────────┐   UpdateEvent      ┌──────┴───────┐
//! │ EditorState │ ─────────────────► │  listeners   │
//! │ (immutable) │  dirty keys, tags  │ (Observers)  │
//! └─────────────┘                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`node`] — Node kinds, text formats, keys
//! - [`state`] — Immutable tree snapshots and selections
//! - [`editor`] — Update transactions, dirty tracking, update events
//! - [`events`] — Listener registries returning drop-to-detach subscriptions
//! - [`json`] — Lexical-compatible JSON import/export

pub mod node;
pub mod state;
pub mod editor;
pub mod events;
pub mod json;

pub use node::{
    ElementKind, FormatFlag, HeadingLevel, ListKind, Node, NodeData, NodeKey, TextFormat,
};
pub use state::{EditorState, Point, Selection};
pub use editor::{Editor, EditorError, Transaction, UpdateEvent, UpdateTag};
pub use events::{Observers, Subscription};
pub use json::{FormatField, SerializedEditorState, SerializedNode};
