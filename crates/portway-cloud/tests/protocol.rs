//! Control-channel protocol tests with a scripted agent: the test speaks
//! the wire format itself, so it can assert the exact frame sequence and
//! the server's reaction to malformed traffic.

use futures_util::{SinkExt, StreamExt};
use portway_cloud::{CloudConfig, CloudServer};
use portway_control::{MemStore, Rule, RuleKind, Store, Token};
use portway_proto::{Frame, FrameCodec, Message, Proto};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_cloud(rules: Vec<Rule>) -> Arc<CloudServer> {
    let store: Arc<dyn Store> = Arc::new(MemStore::seeded(
        rules,
        vec![Token {
            id: "agent-a".to_string(),
            name: "agent-a".to_string(),
            secret: "secret-a".to_string(),
            usage_count: 0,
            created_at: chrono::Utc::now(),
        }],
    ));
    let config = CloudConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        channel_path: "/channel".to_string(),
    };
    let server = Arc::new(CloudServer::bind(config, store).await.unwrap());
    tokio::spawn(server.clone().run());
    server
}

async fn send_frame(ws: &mut Channel, frame: &Frame) {
    let data = FrameCodec::encode(frame).unwrap();
    ws.send(WsMessage::Binary(data.to_vec())).await.unwrap();
}

/// Next protocol frame, skipping heartbeats and transport noise. None
/// means the server closed the channel.
async fn recv_frame(ws: &mut Channel) -> Option<Frame> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")?;
        match msg {
            Ok(WsMessage::Binary(data)) => {
                let frame = FrameCodec::decode_message(&data).unwrap();
                if frame.message == Message::Heartbeat {
                    continue;
                }
                return Some(frame);
            }
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Open a channel and authenticate, returning the assigned agent id.
async fn connect_channel(server: &CloudServer, secret: &str, name: &str) -> (Channel, String) {
    let url = format!("ws://{}/channel", server.local_addr());
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send_frame(&mut ws, &Frame::auth(secret, name)).await;

    match recv_frame(&mut ws).await.expect("auth ack").message {
        Message::AuthAck {
            success: true,
            agent_id,
            ..
        } => (ws, agent_id),
        other => panic!("expected successful auth ack, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_auth_assigns_token_identity() {
    let server = start_cloud(vec![]).await;
    let (_ws, agent_id) = connect_channel(&server, "secret-a", "site-a").await;
    assert_eq!(agent_id, "agent-a");
    assert_eq!(server.registry().count(), 1);
    assert_eq!(server.registry().get("agent-a").unwrap().name, "site-a");
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_bad_token_gets_nack_and_close() {
    let server = start_cloud(vec![]).await;
    let url = format!("ws://{}/channel", server.local_addr());
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    send_frame(&mut ws, &Frame::auth("nope", "x")).await;
    match recv_frame(&mut ws).await.expect("auth nack").message {
        Message::AuthAck { success, error, .. } => {
            assert!(!success);
            assert!(!error.is_empty());
        }
        other => panic!("expected auth nack, got {other:?}"),
    }
    assert!(recv_frame(&mut ws).await.is_none(), "channel should close");
    assert_eq!(server.registry().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_wrong_path_is_rejected() {
    let server = start_cloud(vec![]).await;
    let url = format!("ws://{}/not-the-channel", server.local_addr());
    assert!(connect_async(url.as_str()).await.is_err());
}

/// Scenario A at the frame level: exactly one
/// Connect/ConnectAck/Data/Close exchange for one client connection.
#[tokio::test(flavor = "multi_thread")]
async fn protocol_remote_tcp_frame_sequence() {
    let listen_port = free_port().await;
    let rule = Rule {
        id: "echo".to_string(),
        name: "echo".to_string(),
        kind: RuleKind::CloudToAgent,
        proto: Proto::Tcp,
        source_agent_id: None,
        listen_port,
        target_agent_id: Some("agent-a".to_string()),
        target_host: "127.0.0.1".to_string(),
        target_port: 17000,
        enabled: true,
        rate_limit: 0,
        traffic_limit: 0,
        traffic_used: 0,
        created_at: chrono::Utc::now(),
    };

    let server = start_cloud(vec![rule]).await;
    let (mut ws, _) = connect_channel(&server, "secret-a", "site-a").await;

    // Client connects and sends its line.
    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client.write_all(b"hello\n").await.unwrap();

    // 1. Connect, carrying the rule's target.
    let connect = recv_frame(&mut ws).await.expect("connect frame");
    let tunnel_id = connect.tunnel_id;
    assert!(tunnel_id > 0);
    match connect.message {
        Message::Connect { proto, host, port } => {
            assert_eq!(proto, Proto::Tcp);
            assert_eq!(host, "127.0.0.1");
            assert_eq!(port, 17000);
        }
        other => panic!("expected Connect, got {other:?}"),
    }

    // 2. We ack; the pump starts.
    send_frame(&mut ws, &Frame::connect_ok(tunnel_id)).await;

    // 3. The client's bytes arrive as one Data frame.
    let data = recv_frame(&mut ws).await.expect("data frame");
    assert_eq!(data.tunnel_id, tunnel_id);
    match &data.message {
        Message::Data(bytes) => assert_eq!(bytes.as_ref(), b"hello\n"),
        other => panic!("expected Data, got {other:?}"),
    }

    // 4. Echo back; the client reads it.
    send_frame(&mut ws, &data).await;
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello\n");

    // 5. Client closes; exactly one Close arrives and the table drains.
    drop(client);
    let close = recv_frame(&mut ws).await.expect("close frame");
    assert_eq!(close, Frame::close(tunnel_id));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !server.tunnels().is_empty() {
        assert!(std::time::Instant::now() < deadline, "tunnel leaked");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Nothing further for this tunnel.
    match tokio::time::timeout(Duration::from_millis(500), ws.next()).await {
        Err(_) => {}
        Ok(Some(Ok(WsMessage::Binary(data)))) => {
            let frame = FrameCodec::decode_message(&data).unwrap();
            assert_eq!(frame.message, Message::Heartbeat, "unexpected {frame:?}");
        }
        Ok(other) => panic!("unexpected channel activity: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_connect_refused_drops_client() {
    let listen_port = free_port().await;
    let rule = Rule {
        id: "refused".to_string(),
        name: "refused".to_string(),
        kind: RuleKind::CloudToAgent,
        proto: Proto::Tcp,
        source_agent_id: None,
        listen_port,
        target_agent_id: Some("agent-a".to_string()),
        target_host: "127.0.0.1".to_string(),
        target_port: 1,
        enabled: true,
        rate_limit: 0,
        traffic_limit: 0,
        traffic_used: 0,
        created_at: chrono::Utc::now(),
    };

    let server = start_cloud(vec![rule]).await;
    let (mut ws, _) = connect_channel(&server, "secret-a", "site-a").await;

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    let connect = recv_frame(&mut ws).await.expect("connect frame");
    send_frame(
        &mut ws,
        &Frame::connect_err(connect.tunnel_id, "connection refused"),
    )
    .await;

    // The cloud drops the inbound socket and nothing leaks.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("client should be dropped");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(server.tunnels().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_garbage_frame_closes_session() {
    let server = start_cloud(vec![]).await;
    let (mut ws, _) = connect_channel(&server, "secret-a", "site-a").await;

    ws.send(WsMessage::Binary(vec![0xde, 0xad, 0xbe, 0xef]))
        .await
        .unwrap();

    assert!(recv_frame(&mut ws).await.is_none(), "session should close");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while server.registry().count() != 0 {
        assert!(std::time::Instant::now() < deadline, "session not torn down");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_oversize_frame_closes_session() {
    let server = start_cloud(vec![]).await;
    let (mut ws, _) = connect_channel(&server, "secret-a", "site-a").await;

    // Valid header announcing a payload far past the limit.
    let mut raw = Vec::new();
    raw.push(1u8);
    raw.push(6u8); // data
    raw.extend_from_slice(&1u32.to_be_bytes());
    raw.extend_from_slice(&(64u32 * 1024 * 1024).to_be_bytes());
    ws.send(WsMessage::Binary(raw)).await.unwrap();

    assert!(recv_frame(&mut ws).await.is_none(), "session should close");
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_unexpected_frame_kind_closes_session() {
    let server = start_cloud(vec![]).await;
    let (mut ws, _) = connect_channel(&server, "secret-a", "site-a").await;

    // An agent must never send Connect; that's a cloud-originated message.
    send_frame(&mut ws, &Frame::connect(9, Proto::Tcp, "h", 1)).await;
    assert!(recv_frame(&mut ws).await.is_none(), "session should close");
}
