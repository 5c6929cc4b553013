//! # vibedoc-collab — Real-time collaboration layer for Vibedoc
//!
//! Keeps one local [`vibedoc_core::Editor`] per client converged with every
//! other client editing the same document, through a pure relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  dirty keys   ┌─────────────┐   ops    ┌─────────────┐
//! │   Editor    │ ────────────► │   Adapter   │ ───────► │  DocStore   │
//! │ (local tree)│ ◄──────────── │             │ ◄─────── │   (CRDT)    │
//! └─────────────┘ minimal patch └─────────────┘  events  └──────┬──────┘
//!        ▲                                                      │ Delta
//!        │                ┌──────────────────┐                  ▼
//!        └────────────────│     Binding      │◄──────── Transport (ws / memory)
//!                         │ state machine,   │                  │
//!                         │ undo, awareness  │                  ▼
//!                         └──────────────────┘          ┌─────────────┐
//!                                                       │ RelayServer │
//!                                                       │ rooms, fan- │
//!                                                       │ out, ids    │
//!                                                       └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`] — Replicated document store (RGA tree, LWW formats)
//! - [`adapter`] — Editor tree ⇄ shared document translation
//! - [`undo`] — Local-only undo/redo over shared ops
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`awareness`] — Presence table and leader election
//! - [`transport`] — Transport trait and events
//! - [`provider`] — WebSocket transport with reconnect
//! - [`memory`] — In-process relay and transport
//! - [`binding`] — Synchronization engine
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`relay`] — WebSocket relay server
//! - [`services`] — Snapshot and completion HTTP clients

pub mod crdt;
pub mod adapter;
pub mod undo;
pub mod protocol;
pub mod awareness;
pub mod transport;
pub mod provider;
pub mod memory;
pub mod binding;
pub mod broadcast;
pub mod relay;
pub mod services;

// Re-exports for convenience
pub use crdt::{Delta, DocStore, OpId, Origin, Parent, ReplicaId, StateVector, StoreError, StoreEvent};
pub use adapter::{Adapter, SharedPoint, SharedSelection};
pub use undo::UndoManager;
pub use protocol::{ClientId, MessageType, ProtocolError, SyncMessage, Welcome};
pub use awareness::{pick_leader, AwarenessEvent, AwarenessTracker, CursorColor, ParticipantState};
pub use transport::{ConnectionStatus, Transport, TransportEvent};
pub use provider::{ProviderConfig, WsProvider};
pub use memory::{MemoryRelay, MemoryTransport};
pub use binding::{Binding, BindingConfig, BindingEvent, RemoteCursor, SyncState};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use services::{ServiceConfig, ServiceError};
