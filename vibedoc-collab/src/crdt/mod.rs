//! Replicated document store.
//!
//! A sequence CRDT (RGA family) over a tree: every element item owns an
//! ordered sequence of child items, and every item carries a globally
//! unique [`OpId`] plus a Lamport [`Stamp`].
//!
//! ```text
//!  Root ─┬─ Element(paragraph) ─┬─ Char 'h'
//!        │   id=(r1, 0)         ├─ Char 'i'
//!        │                      └─ Char '!'  (tombstone)
//!        └─ Element(heading h1) ── …
//! ```
//!
//! Merge rules:
//! - Insert: placed right after its origin (left neighbour at creation
//!   time), skipping siblings with a greater stamp. Equal positions are
//!   ordered by `(lamport, replica)`, identically on every replica.
//! - Delete: sets a tombstone. Deleting a tombstone is a no-op.
//! - Format / Retype: last writer wins, keyed on the op stamp.
//!
//! Remote ops whose causal dependencies are missing are parked and
//! retried on later deliveries.
//!
//! Reference: Roh et al., "Replicated abstract data types" (RGA)
//! Reference: Kleppmann, Chapter 5 — Replication

mod store;

pub use store::{Change, Committed, DocStore, LocalTxn, Origin, SharedNode, StoreEvent, DEFAULT_MAX_PENDING_ROUNDS};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;
use vibedoc_core::{ElementKind, FormatFlag, TextFormat};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to decode delta: {0}")]
    Decode(String),
    #[error("Failed to encode delta: {0}")]
    Encode(String),
    #[error("Unknown item {0}")]
    UnknownItem(OpId),
    #[error("Invalid operation: {0}")]
    InvalidOp(String),
}

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Identity of one replica (one store instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_u64_pair().0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Globally unique op id. Clocks are contiguous per replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub clock: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { replica, clock }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// Logical timestamp used for ordering and last-writer-wins.
/// Compared by Lamport counter first, replica id second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub replica: ReplicaId,
}

/// Container of a child sequence: the document root or an element item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Parent {
    Root,
    Item(OpId),
}

impl fmt::Display for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Root => write!(f, "root"),
            Parent::Item(id) => write!(f, "{id}"),
        }
    }
}

/// Next expected clock per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, next: u64) {
        self.0.insert(replica, next);
    }

    /// True when `id` is covered by this vector.
    pub fn contains(&self, id: OpId) -> bool {
        id.clock < self.get(id.replica)
    }

    pub fn replicas(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (sv, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(sv)
    }
}

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// Payload of an inserted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Element(ElementKind),
    Char { ch: char, format: TextFormat },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { parent: Parent, origin: Option<OpId>, content: Content },
    Delete { target: OpId },
    Format { target: OpId, flag: FormatFlag, value: bool },
    Retype { target: OpId, kind: ElementKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub lamport: u64,
    pub kind: OpKind,
}

impl Op {
    pub fn stamp(&self) -> Stamp {
        Stamp { lamport: self.lamport, replica: self.id.replica }
    }
}

/// An appendable batch of ops. Applying a delta twice is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<Op>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn append(&mut self, mut other: Delta) {
        self.ops.append(&mut other.ops);
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (delta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_order_lamport_first() {
        let a = Stamp { lamport: 2, replica: ReplicaId(1) };
        let b = Stamp { lamport: 1, replica: ReplicaId(9) };
        let c = Stamp { lamport: 2, replica: ReplicaId(3) };
        assert!(a > b);
        assert!(c > a);
    }

    #[test]
    fn test_state_vector_contains() {
        let mut sv = StateVector::new();
        sv.set(ReplicaId(1), 3);
        assert!(sv.contains(OpId::new(ReplicaId(1), 2)));
        assert!(!sv.contains(OpId::new(ReplicaId(1), 3)));
        assert!(!sv.contains(OpId::new(ReplicaId(2), 0)));

        let decoded = StateVector::decode(&sv.encode().unwrap()).unwrap();
        assert_eq!(decoded, sv);
    }

    #[test]
    fn test_delta_decode_garbage() {
        assert!(matches!(Delta::decode(&[0xFF, 0xFE, 0xFD]), Err(StoreError::Decode(_))));
    }
}
