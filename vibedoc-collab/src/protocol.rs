//! Binary protocol multiplexing document deltas and awareness on one
//! channel per `(server_url, doc_id)`.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────────┬──────────┬──────────┐
//! │ msg_type │ sender    │ target        │ doc_id   │ payload  │
//! │ 1 byte   │ varint    │ 1 + varint    │ 16 bytes │ variable │
//! └──────────┴───────────┴───────────────┴──────────┴──────────┘
//! ```
//!
//! `sender` is the relay-assigned [`ClientId`]; the relay overwrites it on
//! every inbound frame. `target = None` fans out to the room, `Some(id)`
//! is delivered to that client only.
//!
//! Handshake:
//! ```text
//! client ── Join ──────────────► relay
//! client ◄─ Welcome{id, peers} ─ relay     peers empty ⇒ first replica
//! client ── SyncStep1(sv) ─────► room
//! client ◄─ SyncStep2(diff) ──── peer      (directed)
//! client ◄─ SyncStep1(sv) ────── peer      (directed, reverse catch-up)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector; asks peers for what the sender lacks
    SyncStep1 = 1,
    /// Delta answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental delta of a local edit
    Update = 3,
    /// Encoded participant state
    Awareness = 4,
    /// Relay reply to Join: assigned id and current peers
    Welcome = 5,
    /// A client left the room (closed or stopped heartbeating)
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// First frame of a connection
    Join = 9,
}

/// Transport-assigned participant id. Unique and increasing per relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Placeholder used before the relay has assigned an id.
    pub const UNASSIGNED: ClientId = ClientId(0);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Payload of [`MessageType::Welcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub client_id: ClientId,
    /// Clients already in the room.
    pub peers: Vec<ClientId>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub sender: ClientId,
    pub target: Option<ClientId>,
    pub doc_id: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, doc_id: Uuid, payload: Vec<u8>) -> Self {
        Self { msg_type, sender: ClientId::UNASSIGNED, target: None, doc_id, payload }
    }

    pub fn join(doc_id: Uuid) -> Self {
        Self::new(MessageType::Join, doc_id, Vec::new())
    }

    pub fn welcome(doc_id: Uuid, welcome: &Welcome) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Welcome, doc_id, encode_payload(welcome)?))
    }

    /// Incremental update carrying an encoded delta.
    pub fn update(doc_id: Uuid, delta: Vec<u8>) -> Self {
        Self::new(MessageType::Update, doc_id, delta)
    }

    /// Broadcast (or directed) state vector request.
    pub fn sync_step1(doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, doc_id, state_vector)
    }

    /// Diff response; always addressed to the requester.
    pub fn sync_step2(doc_id: Uuid, diff: Vec<u8>, to: ClientId) -> Self {
        Self::new(MessageType::SyncStep2, doc_id, diff).addressed_to(to)
    }

    pub fn awareness(doc_id: Uuid, state: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, doc_id, state)
    }

    pub fn peer_left(doc_id: Uuid, client: ClientId) -> Self {
        let mut msg = Self::new(MessageType::PeerLeft, doc_id, Vec::new());
        msg.sender = client;
        msg
    }

    pub fn ping(doc_id: Uuid) -> Self {
        Self::new(MessageType::Ping, doc_id, Vec::new())
    }

    pub fn pong(doc_id: Uuid) -> Self {
        Self::new(MessageType::Pong, doc_id, Vec::new())
    }

    /// Address this message to a single client.
    pub fn addressed_to(mut self, target: ClientId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_sender(mut self, sender: ClientId) -> Self {
        self.sender = sender;
        self
    }

    /// True for messages the relay should hand to `client`.
    pub fn is_for(&self, client: ClientId) -> bool {
        self.sender != client && self.target.map_or(true, |t| t == client)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse the welcome payload.
    pub fn welcome_info(&self) -> Result<Welcome, ProtocolError> {
        if self.msg_type != MessageType::Welcome {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

/// bincode (standard config) encoding shared by all payloads.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

pub fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let doc = Uuid::new_v4();
        let msg = SyncMessage::update(doc, vec![1, 2, 3]).with_sender(ClientId(4));
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.sender, ClientId(4));
        assert_eq!(decoded.target, None);
    }

    #[test]
    fn test_sync_step2_is_directed() {
        let msg = SyncMessage::sync_step2(Uuid::nil(), vec![9], ClientId(2)).with_sender(ClientId(1));
        assert_eq!(msg.target, Some(ClientId(2)));
        assert!(msg.is_for(ClientId(2)));
        assert!(!msg.is_for(ClientId(3)));
        assert!(!msg.is_for(ClientId(1)));
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let msg = SyncMessage::awareness(Uuid::nil(), Vec::new()).with_sender(ClientId(5));
        assert!(!msg.is_for(ClientId(5)));
        assert!(msg.is_for(ClientId(6)));
    }

    #[test]
    fn test_welcome_payload() {
        let welcome = Welcome { client_id: ClientId(3), peers: vec![ClientId(1), ClientId(2)] };
        let msg = SyncMessage::welcome(Uuid::new_v4(), &welcome).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.welcome_info().unwrap(), welcome);
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(Uuid::nil());
        assert_eq!(msg.welcome_info(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            SyncMessage::decode(&garbage),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(Uuid::new_v4(), vec![0u8; 50]).with_sender(ClientId(12));
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 100, "Encoded size {} too large for 50-byte delta", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
        assert_eq!(MessageType::Welcome as u8, 5);
        assert_eq!(MessageType::PeerLeft as u8, 6);
        assert_eq!(MessageType::Join as u8, 9);
    }
}
