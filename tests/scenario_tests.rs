//! End-to-end scenario tests against a scripted stub broker: a minimal
//! `tokio-tungstenite` WebSocket server that speaks just enough of the wire
//! protocol to drive the agent through a handshake and a few packets.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use m2m_agent::bencode::Value;
use m2m_agent::config::AgentConfig;
use m2m_agent::packet::Packet;
use m2m_agent::rpc::{LoggingInputDeviceRouter, LoggingRpcClient};
use m2m_agent::Manager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn stub_broker() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (format!("ws://{addr}/m2m/"), listener)
}

async fn accept(listener: TcpListener) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn send(ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>, packet: Packet) {
    ws.send(Message::Binary(packet.encode())).await.unwrap();
}

async fn recv_packet(ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Packet {
    loop {
        match ws.next().await.expect("stream ended").unwrap() {
            Message::Binary(bytes) => return Packet::decode(&bytes).expect("valid packet"),
            _ => continue,
        }
    }
}

fn test_config(url: String) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.m2m.url = url;
    config
}

fn new_manager(config: &AgentConfig) -> Arc<Manager> {
    Manager::new(
        config,
        Arc::new(LoggingRpcClient),
        Arc::new(LoggingInputDeviceRouter),
    )
}

#[tokio::test]
async fn ping_reply_is_truncated_to_1024_bytes() {
    let (url, listener) = stub_broker().await;
    let config = test_config(url);
    let manager = new_manager(&config);
    let _run = manager.run();

    let mut ws = accept(listener).await;

    // handshake: expect join-req, reply with an identity then welcome.
    assert_eq!(recv_packet(&mut ws).await, Packet::JoinReq);
    send(&mut ws, Packet::SetIdentity { uuid: b"node-1".to_vec() }).await;
    send(&mut ws, Packet::Welcome).await;

    send(&mut ws, Packet::Ping { data: vec![0xAA; 4096] }).await;
    let reply = recv_packet(&mut ws).await;
    match reply {
        Packet::Pong { data } => assert_eq!(data.len(), 1024),
        other => panic!("expected pong, got {other:?}"),
    }

    manager.close().await;
}

#[tokio::test]
async fn malformed_frame_is_dropped_without_closing_the_connection() {
    let (url, listener) = stub_broker().await;
    let config = test_config(url);
    let manager = new_manager(&config);
    let _run = manager.run();

    let mut ws = accept(listener).await;
    assert_eq!(recv_packet(&mut ws).await, Packet::JoinReq);
    send(&mut ws, Packet::SetIdentity { uuid: b"node-1".to_vec() }).await;
    send(&mut ws, Packet::Welcome).await;

    // Not valid Bencode at all.
    ws.send(Message::Binary(b"not a packet".to_vec())).await.unwrap();

    // The connection should still be alive: a well-formed ping still gets a reply.
    send(&mut ws, Packet::Ping { data: vec![1, 2, 3] }).await;
    let reply = recv_packet(&mut ws).await;
    assert_eq!(reply, Packet::Pong { data: vec![1, 2, 3] });

    manager.close().await;
}

#[tokio::test]
async fn open_echo_instruction_echoes_channel_data_back() {
    let (url, listener) = stub_broker().await;
    let config = test_config(url);
    let manager = new_manager(&config);
    let _run = manager.run();

    let mut ws = accept(listener).await;
    assert_eq!(recv_packet(&mut ws).await, Packet::JoinReq);
    send(&mut ws, Packet::SetIdentity { uuid: b"node-1".to_vec() }).await;
    send(&mut ws, Packet::Welcome).await;

    let mut data = BTreeMap::new();
    data.insert(b"action".to_vec(), Value::from("open-echo"));
    data.insert(b"port".to_vec(), Value::Int(7));
    send(
        &mut ws,
        Packet::Instruction {
            sender: b"controller".to_vec(),
            data,
        },
    )
    .await;

    send(
        &mut ws,
        Packet::Route {
            channel: 7,
            data: b"hello".to_vec(),
        },
    )
    .await;

    let reply = tokio::time::timeout(Duration::from_secs(2), recv_packet(&mut ws))
        .await
        .expect("echo reply within timeout");
    assert_eq!(
        reply,
        Packet::SendReq {
            channel: 7,
            data: b"hello".to_vec(),
        }
    );

    manager.close().await;
}

#[tokio::test]
async fn prior_identity_is_presented_via_identify_req_on_connect() {
    let (url, listener) = stub_broker().await;

    struct NullSink;
    impl m2m_agent::ws_client::ClientEventSink for NullSink {
        fn on_instruction(&self, _sender: Vec<u8>, _data: BTreeMap<Vec<u8>, Value>) {}
        fn on_close(&self) {}
    }

    let client = m2m_agent::ws_client::WsClient::connect(
        url,
        Some("stable-id".to_string()),
        false,
        Arc::new(NullSink),
    );

    let mut ws = accept(listener).await;
    match recv_packet(&mut ws).await {
        Packet::IdentifyReq { uuid } => assert_eq!(uuid, b"stable-id"),
        other => panic!("expected identify-req carrying the prior identity, got {other:?}"),
    }

    send(&mut ws, Packet::SetIdentity { uuid: b"stable-id".to_vec() }).await;
    send(&mut ws, Packet::Welcome).await;
    let identity = client
        .wait_ready(Duration::from_secs(2))
        .await
        .expect("identity after welcome");
    assert_eq!(identity, "stable-id");
}
