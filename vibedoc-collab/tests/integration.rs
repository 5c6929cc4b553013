//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real relay on an ephemeral port and connect raw
//! sockets or full bindings to it.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use vibedoc_collab::binding::{Binding, BindingConfig, SyncState};
use vibedoc_collab::protocol::{ClientId, MessageType, SyncMessage, Welcome};
use vibedoc_collab::provider::{ProviderConfig, WsProvider};
use vibedoc_collab::relay::{RelayConfig, RelayServer};
use vibedoc_collab::transport::{ConnectionStatus, Transport};
use vibedoc_core::{Editor, TextFormat};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on a free port and return its ws:// URL.
async fn start_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = RelayServer::new(RelayConfig::default());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    url
}

async fn send(socket: &mut Socket, msg: SyncMessage) {
    socket.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
}

/// Next protocol frame, or None if nothing arrives within `wait`.
async fn recv_within(socket: &mut Socket, wait: Duration) -> Option<SyncMessage> {
    let deadline = Instant::now() + wait;
    loop {
        let next = tokio::time::timeout_at(deadline, socket.next()).await.ok()??;
        if let Ok(Message::Binary(data)) = next {
            let bytes: Vec<u8> = data.into();
            return Some(SyncMessage::decode(&bytes).unwrap());
        }
    }
}

async fn recv(socket: &mut Socket) -> SyncMessage {
    recv_within(socket, Duration::from_secs(2)).await.expect("frame expected")
}

async fn join(url: &str, doc: Uuid) -> (Socket, Welcome) {
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("{url}/{doc}")).await.unwrap();
    send(&mut socket, SyncMessage::join(doc)).await;
    let welcome = recv(&mut socket).await.welcome_info().unwrap();
    (socket, welcome)
}

// ─── Relay ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_assigns_ids_and_lists_peers() {
    let url = start_relay().await;
    let doc = Uuid::new_v4();

    let (_a, first) = join(&url, doc).await;
    let (_b, second) = join(&url, doc).await;

    assert!(first.peers.is_empty());
    assert!(second.client_id > first.client_id);
    assert_eq!(second.peers, vec![first.client_id]);
}

#[tokio::test]
async fn test_frames_fan_out_without_echo() {
    let url = start_relay().await;
    let doc = Uuid::new_v4();
    let (mut a, wa) = join(&url, doc).await;
    let (mut b, _) = join(&url, doc).await;

    send(&mut a, SyncMessage::update(doc, vec![1, 2, 3])).await;

    let got = recv(&mut b).await;
    assert_eq!(got.msg_type, MessageType::Update);
    assert_eq!(got.sender, wa.client_id);
    assert_eq!(got.payload, vec![1, 2, 3]);
    assert!(recv_within(&mut a, Duration::from_millis(150)).await.is_none());
}

#[tokio::test]
async fn test_directed_frames_reach_only_target() {
    let url = start_relay().await;
    let doc = Uuid::new_v4();
    let (mut a, _) = join(&url, doc).await;
    let (mut b, _) = join(&url, doc).await;
    let (mut c, wc) = join(&url, doc).await;

    send(&mut a, SyncMessage::sync_step2(doc, vec![9], wc.client_id)).await;

    let got = recv(&mut c).await;
    assert_eq!(got.msg_type, MessageType::SyncStep2);
    assert_eq!(got.target, Some(wc.client_id));
    assert!(recv_within(&mut b, Duration::from_millis(150)).await.is_none());
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let url = start_relay().await;
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();
    let (mut a, _) = join(&url, doc_a).await;
    let (mut b, welcome) = join(&url, doc_b).await;
    assert!(welcome.peers.is_empty());

    send(&mut a, SyncMessage::update(doc_a, vec![7])).await;
    assert!(recv_within(&mut b, Duration::from_millis(150)).await.is_none());
}

#[tokio::test]
async fn test_peer_left_on_close() {
    let url = start_relay().await;
    let doc = Uuid::new_v4();
    let (mut a, _) = join(&url, doc).await;
    let (mut b, wb) = join(&url, doc).await;

    b.close(None).await.unwrap();

    let got = recv(&mut a).await;
    assert_eq!(got.msg_type, MessageType::PeerLeft);
    assert_eq!(got.sender, wb.client_id);
}

#[tokio::test]
async fn test_ping_pong() {
    let url = start_relay().await;
    let doc = Uuid::new_v4();
    let (mut a, _) = join(&url, doc).await;

    send(&mut a, SyncMessage::ping(doc)).await;
    assert_eq!(recv(&mut a).await.msg_type, MessageType::Pong);
}

// ─── Bindings over the relay ───────────────────────────────────────

type WsBinding = Binding<WsProvider>;

fn binding(url: &str, doc: Uuid, name: &str) -> WsBinding {
    let config = BindingConfig { user_name: name.to_string(), ..BindingConfig::default() };
    Binding::new(Editor::new(), WsProvider::new(ProviderConfig::new(url), doc), doc, config)
}

/// Step both bindings in turn until `done` holds or five seconds pass.
async fn pump(a: &mut WsBinding, b: &mut WsBinding, done: impl Fn(&WsBinding, &WsBinding) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done(a, b) {
            return true;
        }
        let _ = timeout(Duration::from_millis(10), a.step()).await;
        let _ = timeout(Duration::from_millis(10), b.step()).await;
    }
    done(a, b)
}

fn type_text(binding: &mut WsBinding, text: &str) {
    binding
        .update(&[], |txn| {
            let root = txn.root();
            let block = txn.state().children(root)[0];
            txn.append_text(block, text, TextFormat::default()).map(|_| ())
        })
        .unwrap();
}

#[tokio::test]
async fn test_bindings_converge_over_relay() {
    let url = start_relay().await;
    let doc = Uuid::new_v4();
    let mut a = binding(&url, doc, "alice");
    let mut b = binding(&url, doc, "bob");

    a.connect();
    assert!(a.run_until(Duration::from_secs(5), |a| a.state() == SyncState::Synced).await);
    type_text(&mut a, "hello");

    b.connect();
    assert!(pump(&mut a, &mut b, |_, b| b.state() == SyncState::Synced && b.plain_text() == "hello").await);

    type_text(&mut b, " world");
    assert!(pump(&mut a, &mut b, |a, _| a.plain_text() == "hello world").await);
    assert_eq!(a.store().snapshot(), b.store().snapshot());
}

#[tokio::test]
async fn test_leader_follows_departures() {
    let url = start_relay().await;
    let doc = Uuid::new_v4();
    let mut a = binding(&url, doc, "alice");
    let mut b = binding(&url, doc, "bob");

    a.connect();
    assert!(a.run_until(Duration::from_secs(5), |a| a.state() == SyncState::Synced).await);
    b.connect();
    assert!(pump(&mut a, &mut b, |a, b| a.awareness().participants().len() == 2
        && b.awareness().participants().len() == 2)
    .await);
    assert!(a.is_leader());
    assert!(!b.is_leader());
    assert_eq!(b.awareness().leader(), Some(a.client_id()));

    a.disconnect();
    assert!(pump(&mut a, &mut b, |_, b| b.is_leader()).await);
    assert!(!a.is_leader());
}

#[tokio::test]
async fn test_reconnect_catches_up() {
    let url = start_relay().await;
    let doc = Uuid::new_v4();
    let mut a = binding(&url, doc, "alice");
    let mut b = binding(&url, doc, "bob");

    a.connect();
    assert!(a.run_until(Duration::from_secs(5), |a| a.state() == SyncState::Synced).await);
    b.connect();
    assert!(pump(&mut a, &mut b, |_, b| b.state() == SyncState::Synced).await);

    b.disconnect();
    assert_eq!(b.state(), SyncState::Disconnected);
    assert_eq!(b.transport().status(), ConnectionStatus::Disconnected);
    type_text(&mut a, "while ");
    type_text(&mut b, "away");

    b.connect();
    assert!(
        pump(&mut a, &mut b, |a, b| b.state() == SyncState::Synced
            && a.plain_text() == b.plain_text()
            && a.plain_text().len() == "while away".len())
        .await
    );
    assert_ne!(b.client_id(), ClientId::UNASSIGNED);
    assert_eq!(a.store().snapshot(), b.store().snapshot());
}
