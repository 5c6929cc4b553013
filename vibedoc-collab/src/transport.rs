//! Transport seam between a [`Binding`](crate::binding::Binding) and the
//! relay.
//!
//! Implementations own reconnection. Everything they learn is reported
//! as a [`TransportEvent`] on one ordered channel, so the binding can be
//! driven synchronously (`try_recv`) or asynchronously (`recv`).

use tokio::sync::mpsc;

use crate::protocol::{ProtocolError, SyncMessage, Welcome};

/// Connection status surfaced to the UI indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Joined the room; a `Welcome` follows.
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    /// Assigned id and peers already present. Sent once per connection.
    Welcome(Welcome),
    /// Any other frame from the room, sender stamped by the relay.
    Message(SyncMessage),
}

/// A pub/sub channel addressed by `(server_url, doc_id)`.
pub trait Transport: Send {
    /// Start connecting (and keep reconnecting) in the background.
    fn connect(&mut self);

    /// Drop the connection and stop reconnecting.
    fn disconnect(&mut self);

    /// Queue `msg` for the room. Fails while not connected; callers
    /// treat sends as best-effort.
    fn send(&mut self, msg: SyncMessage) -> Result<(), ProtocolError>;

    fn status(&self) -> ConnectionStatus;

    /// Ordered stream of everything the transport observed.
    fn events(&mut self) -> &mut mpsc::Receiver<TransportEvent>;
}
