//! Integration tests for end-to-end canvas sync.
//!
//! These tests start a real server and connect real clients, verifying
//! the full path from socket to grid and back out to the other peers.

use futures_util::{SinkExt, StreamExt};
use pixboard_core::{Color, GridError, Region};
use pixboard_sync::client::{ConnectionState, SyncClient, SyncEvent};
use pixboard_sync::config::ServerConfig;
use pixboard_sync::protocol::{
    CellChange, ChangeKind, ClientMessage, PlayerId, RejectReason, Rejection, ServerMessage,
    WireFormat,
};
use pixboard_sync::server::SyncServer;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and the server handle.
async fn start_test_server(config: ServerConfig) -> (u16, Arc<SyncServer>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(config).unwrap());
    let handle = server.clone();
    tokio::spawn(async move {
        handle.run_on(listener).await.unwrap();
    });
    (port, server)
}

async fn connect_raw(port: u16, query: &str) -> RawSocket {
    let url = format!("ws://127.0.0.1:{port}/{query}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

/// Next data frame, decoded according to its frame type.
async fn recv_raw(ws: &mut RawSocket) -> (WireFormat, ServerMessage) {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for frame")
            .expect("Stream ended")
            .unwrap();
        match msg {
            Message::Binary(data) => {
                return (WireFormat::Binary, ServerMessage::decode_binary(&data).unwrap())
            }
            Message::Text(text) => {
                return (WireFormat::Json, ServerMessage::decode_json(text.as_str()).unwrap())
            }
            _ => continue,
        }
    }
}

async fn send_raw(ws: &mut RawSocket, msg: &ClientMessage, format: WireFormat) {
    ws.send(msg.encode(format).unwrap().into()).await.unwrap();
}

async fn next_server_message(events: &mut mpsc::Receiver<SyncEvent>) -> ServerMessage {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::Server(msg))) => return msg,
            Ok(Some(_)) => continue,
            other => panic!("Expected server message, got {other:?}"),
        }
    }
}

/// Connect a client and wait for its `init`.
async fn connect_client(
    port: u16,
    player: Option<&str>,
    format: WireFormat,
) -> (SyncClient, mpsc::Receiver<SyncEvent>, ServerMessage) {
    let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"), format);
    if let Some(id) = player {
        client = client.with_player(PlayerId::new(id).unwrap());
    }
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let init = next_server_message(&mut events).await;
    assert!(matches!(init, ServerMessage::Init(_)), "first message was {init:?}");
    (client, events, init)
}

fn red() -> Color {
    Color::parse_hex("#FF0000").unwrap()
}

#[tokio::test]
async fn test_server_sends_init_first() {
    let (port, _server) = start_test_server(ServerConfig::default()).await;
    let mut ws = connect_raw(port, "").await;

    let (format, msg) = recv_raw(&mut ws).await;
    assert_eq!(format, WireFormat::Binary);
    let ServerMessage::Init(init) = msg else {
        panic!("Expected init, got {msg:?}");
    };
    assert_eq!(init.grid.width(), 80);
    assert_eq!(init.grid.height(), 80);
    assert_eq!(init.grid.get(0, 0), Some(Color::WHITE));
    assert_eq!(init.players, Some(vec![]));
}

#[tokio::test]
async fn test_client_connects() {
    let (port, _server) = start_test_server(ServerConfig::default()).await;
    let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"), WireFormat::Binary);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_first_paint_reaches_other_client() {
    let (port, server) = start_test_server(ServerConfig::default()).await;
    let (alice, _alice_events, _) = connect_client(port, Some("p1"), WireFormat::Binary).await;
    let (_bob, mut bob_events, _) = connect_client(port, None, WireFormat::Json).await;

    // Bob sees p1 arrive (or already had it in init)
    alice
        .send(&ClientMessage::CellChange(CellChange::paint(5, 5, red())))
        .await
        .unwrap();

    let change = loop {
        match next_server_message(&mut bob_events).await {
            ServerMessage::CellChange(c) => break c,
            ServerMessage::PlayerJoined { .. } => continue,
            other => panic!("Unexpected {other:?}"),
        }
    };
    assert_eq!(
        change,
        CellChange::paint(5, 5, red()).with_player(Some(PlayerId::new("p1").unwrap()))
    );
    assert_eq!(server.hub().cell(5, 5).await.unwrap(), red());
}

#[tokio::test]
async fn test_sender_does_not_get_echo() {
    let (port, server) = start_test_server(ServerConfig::default()).await;
    let (alice, mut alice_events, _) = connect_client(port, None, WireFormat::Binary).await;

    alice
        .send(&ClientMessage::CellChange(CellChange::paint(1, 1, red())))
        .await
        .unwrap();
    alice.send_ping().await.unwrap();

    // Pong comes back; the paint does not.
    assert_eq!(next_server_message(&mut alice_events).await, ServerMessage::Pong);
    assert_eq!(server.hub().cell(1, 1).await.unwrap(), red());
}

#[tokio::test]
async fn test_fan_out_to_all_others() {
    let (port, _server) = start_test_server(ServerConfig::default()).await;
    let (sender, mut sender_events, _) = connect_client(port, None, WireFormat::Binary).await;
    let mut others = Vec::new();
    for _ in 0..3 {
        others.push(connect_client(port, None, WireFormat::Binary).await);
    }

    sender
        .send(&ClientMessage::CellChange(CellChange::paint(2, 3, Color::BLACK)))
        .await
        .unwrap();

    for (_, events, _) in others.iter_mut() {
        assert_eq!(
            next_server_message(events).await,
            ServerMessage::CellChange(CellChange::paint(2, 3, Color::BLACK))
        );
    }

    sender.send_ping().await.unwrap();
    assert_eq!(next_server_message(&mut sender_events).await, ServerMessage::Pong);
}

#[tokio::test]
async fn test_late_joiner_init_has_earlier_writes() {
    let (port, _server) = start_test_server(ServerConfig::default()).await;
    let (early, mut early_events, _) = connect_client(port, None, WireFormat::Binary).await;

    for x in 0..4 {
        early
            .send(&ClientMessage::CellChange(CellChange::paint(x, 7, Color::BLACK)))
            .await
            .unwrap();
    }
    // Ping round-trip guarantees the paints were applied
    early.send_ping().await.unwrap();
    assert_eq!(next_server_message(&mut early_events).await, ServerMessage::Pong);

    let (_late, _late_events, init) = connect_client(port, None, WireFormat::Json).await;
    let ServerMessage::Init(init) = init else {
        unreachable!()
    };
    for x in 0..4 {
        assert_eq!(init.grid.get(x, 7), Some(Color::BLACK));
    }
    assert_eq!(init.grid.get(4, 7), Some(Color::WHITE));
}

#[tokio::test]
async fn test_region_rejection_acknowledged() {
    let mut config = ServerConfig::default();
    config.canvas.editable_region = Some(Region::new(5, 5, 70, 70));
    let (port, server) = start_test_server(config).await;

    let (alice, mut alice_events, init) = connect_client(port, None, WireFormat::Binary).await;
    let ServerMessage::Init(init) = init else {
        unreachable!()
    };
    assert_eq!(init.editable_region, Some(Region::new(5, 5, 70, 70)));

    alice
        .send(&ClientMessage::CellChange(CellChange::paint(0, 0, red())))
        .await
        .unwrap();
    assert_eq!(
        next_server_message(&mut alice_events).await,
        ServerMessage::Rejected(Rejection {
            x: 0,
            y: 0,
            kind: ChangeKind::Paint,
            reason: RejectReason::OutsideEditableRegion,
        })
    );
    assert_eq!(server.hub().cell(0, 0).await.unwrap(), Color::WHITE);

    alice
        .send(&ClientMessage::CellChange(CellChange::paint(-1, 200, red())))
        .await
        .unwrap();
    match next_server_message(&mut alice_events).await {
        ServerMessage::Rejected(r) => assert_eq!(r.reason, RejectReason::OutOfBounds),
        other => panic!("Expected rejection, got {other:?}"),
    }
    assert!(matches!(
        server.hub().cell(-1, 200).await,
        Err(GridError::OutOfBounds { .. })
    ));
}

#[tokio::test]
async fn test_silent_policy_drops_rejection() {
    let mut config = ServerConfig::default();
    config.rejection = pixboard_sync::RejectionPolicy::Silent;
    let (port, _server) = start_test_server(config).await;
    let (alice, mut alice_events, _) = connect_client(port, None, WireFormat::Binary).await;

    alice
        .send(&ClientMessage::CellChange(CellChange::paint(500, 0, red())))
        .await
        .unwrap();
    alice.send_ping().await.unwrap();
    assert_eq!(next_server_message(&mut alice_events).await, ServerMessage::Pong);
}

#[tokio::test]
async fn test_json_format_end_to_end() {
    let (port, _server) = start_test_server(ServerConfig::default()).await;
    let mut browser = connect_raw(port, "?format=json").await;
    let mut native = connect_raw(port, "").await;

    let (format, _) = recv_raw(&mut browser).await;
    assert_eq!(format, WireFormat::Json);
    let (format, _) = recv_raw(&mut native).await;
    assert_eq!(format, WireFormat::Binary);

    browser
        .send(Message::Text(
            r##"{"cellChange":{"x":9,"y":9,"color":"#00ff00"}}"##.into(),
        ))
        .await
        .unwrap();

    let (format, msg) = recv_raw(&mut native).await;
    assert_eq!(format, WireFormat::Binary);
    assert_eq!(
        msg,
        ServerMessage::CellChange(CellChange::paint(9, 9, Color::rgb(0, 255, 0)))
    );
}

#[tokio::test]
async fn test_reply_follows_last_used_format() {
    let (port, _server) = start_test_server(ServerConfig::default()).await;
    let mut ws = connect_raw(port, "").await;
    let _init = recv_raw(&mut ws).await;

    send_raw(&mut ws, &ClientMessage::Ping, WireFormat::Json).await;
    assert_eq!(recv_raw(&mut ws).await, (WireFormat::Json, ServerMessage::Pong));

    send_raw(&mut ws, &ClientMessage::Ping, WireFormat::Binary).await;
    assert_eq!(recv_raw(&mut ws).await, (WireFormat::Binary, ServerMessage::Pong));
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let (port, server) = start_test_server(ServerConfig::default()).await;
    let mut ws = connect_raw(port, "?format=json").await;
    let _init = recv_raw(&mut ws).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"cellChange":{"x":1,"y":1,"color":"blue"}}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Binary(vec![0xFF, 0xFF, 0xFF].into())).await.unwrap();

    send_raw(&mut ws, &ClientMessage::Ping, WireFormat::Json).await;
    assert_eq!(recv_raw(&mut ws).await.1, ServerMessage::Pong);

    let stats = server.stats().await;
    assert_eq!(stats.malformed_messages, 3);
    assert_eq!(stats.total_messages, 4);
    assert_eq!(server.hub().cell(1, 1).await.unwrap(), Color::WHITE);
}

#[tokio::test]
async fn test_huge_length_prefix_does_not_take_server_down() {
    let (port, server) = start_test_server(ServerConfig::default()).await;
    let mut bystander = connect_raw(port, "").await;
    let _init = recv_raw(&mut bystander).await;
    let mut ws = connect_raw(port, "").await;
    let _init = recv_raw(&mut ws).await;

    // join whose id claims 2^50 bytes
    let mut frame = vec![0x00, 0xFD];
    frame.extend_from_slice(&(1u64 << 50).to_le_bytes());
    ws.send(Message::Binary(frame.into())).await.unwrap();

    send_raw(&mut ws, &ClientMessage::Ping, WireFormat::Binary).await;
    assert_eq!(recv_raw(&mut ws).await.1, ServerMessage::Pong);
    send_raw(&mut bystander, &ClientMessage::Ping, WireFormat::Binary).await;
    assert_eq!(recv_raw(&mut bystander).await.1, ServerMessage::Pong);

    assert_eq!(server.stats().await.malformed_messages, 1);
    assert!(server.hub().roster().await.is_empty());
}

#[tokio::test]
async fn test_heartbeat_pings() {
    let config = ServerConfig {
        heartbeat_interval_secs: 1,
        ..ServerConfig::default()
    };
    let (port, _server) = start_test_server(config).await;
    let mut ws = connect_raw(port, "").await;

    let got_ping = timeout(Duration::from_secs(3), async {
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Ping(_)) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(got_ping, "Expected a heartbeat ping");
}

#[tokio::test]
async fn test_connection_cap() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let (port, server) = start_test_server(config).await;
    let mut first = connect_raw(port, "").await;
    let _init = recv_raw(&mut first).await;

    let url = format!("ws://127.0.0.1:{port}");
    let second = timeout(Duration::from_secs(2), tokio_tungstenite::connect_async(&url)).await;
    assert!(matches!(second, Ok(Err(_))), "second connection should be refused");

    let stats = server.stats().await;
    assert_eq!(stats.refused_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.total_connections, 1);
}

#[tokio::test]
async fn test_active_connections_drop_on_close() {
    let (port, server) = start_test_server(ServerConfig::default()).await;
    let mut ws = connect_raw(port, "").await;
    let _init = recv_raw(&mut ws).await;
    assert_eq!(server.stats().await.active_connections, 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            if server.stats().await.active_connections == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(closed.is_ok(), "active connection count never dropped");
}
