use futures_util::{SinkExt, StreamExt};
use jobpulse_core::wire::{
    decode_frame, encode_frame, HelloPayload, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use jobpulse_hub::{serve, HubConfig, HubState};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_hub(config: HubConfig) -> (Arc<HubState>, SocketAddr) {
    let hub = Arc::new(HubState::new(config));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let served = hub.clone();
    tokio::spawn(async move {
        let _ = serve(listener, served, std::future::pending()).await;
    });
    (hub, addr)
}

async fn send(ws: &mut Socket, msg: WireMsg) {
    let text = encode_frame(&WireEnvelope::new(msg), DEFAULT_MAX_FRAME_BYTES).expect("encode");
    ws.send(Message::Text(text)).await.expect("send");
}

async fn recv(ws: &mut Socket) -> WireMsg {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = frame {
            let envelope: WireEnvelope =
                decode_frame(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            return envelope.msg;
        }
    }
}

async fn handshake(addr: SocketAddr, token: &str) -> (Socket, WireMsg) {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.expect("connect");
    send(
        &mut ws,
        WireMsg::Hello(HelloPayload {
            client_id: "test-client".to_string(),
            token: token.to_string(),
        }),
    )
    .await;
    let reply = recv(&mut ws).await;
    (ws, reply)
}

fn connection_id(reply: &WireMsg) -> String {
    match reply {
        WireMsg::Welcome(welcome) => welcome.connection_id.clone(),
        other => panic!("expected welcome, got {other:?}"),
    }
}

async fn wait_for_members(hub: &HubState, topic: &str, expected: usize) {
    for _ in 0..200 {
        if hub.subscriber_count(topic).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("topic {topic} never reached {expected} members");
}

#[tokio::test]
async fn joined_connection_receives_only_its_topic() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let (mut ws, reply) = handshake(addr, "token").await;
    let conn_id = connection_id(&reply);

    send(&mut ws, WireMsg::join("job:A")).await;
    wait_for_members(&hub, "job:A", 1).await;
    assert_eq!(hub.topics_for(&conn_id).await, vec!["job:A".to_string()]);

    assert_eq!(hub.publish("job:B", "job-progress", json!({"progress": 5})).await, 0);
    assert_eq!(hub.publish("job:A", "job-progress", json!({"progress": 10})).await, 1);
    match recv(&mut ws).await {
        WireMsg::Event(event) => {
            assert_eq!(event.topic, "job:A");
            assert_eq!(event.event, "job-progress");
            assert_eq!(event.payload, json!({"progress": 10}));
        }
        other => panic!("unexpected frame {other:?}"),
    }

    send(&mut ws, WireMsg::leave("job:A")).await;
    wait_for_members(&hub, "job:A", 0).await;
    assert!(hub.topics_for(&conn_id).await.is_empty());
}

#[tokio::test]
async fn unknown_token_is_rejected() {
    let config = HubConfig {
        tokens: ["secret".to_string()].into_iter().collect(),
        ..HubConfig::default()
    };
    let (hub, addr) = start_hub(config).await;
    let (_ws, reply) = handshake(addr, "wrong").await;
    match reply {
        WireMsg::Rejected(payload) => assert_eq!(payload.code, "unauthorized"),
        other => panic!("unexpected frame {other:?}"),
    }
    assert_eq!(hub.connection_count().await, 0);
}

#[tokio::test]
async fn drop_connections_closes_sockets_and_forgets_topics() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let (mut ws, reply) = handshake(addr, "token").await;
    let conn_id = connection_id(&reply);
    send(&mut ws, WireMsg::join("conversation:c1")).await;
    send(&mut ws, WireMsg::join("job:J1")).await;
    wait_for_members(&hub, "conversation:c1", 1).await;
    wait_for_members(&hub, "job:J1", 1).await;
    assert_eq!(
        hub.topics_for(&conn_id).await,
        vec!["conversation:c1".to_string(), "job:J1".to_string()]
    );

    assert_eq!(hub.drop_connections().await, 1);
    assert_eq!(hub.subscriber_count("conversation:c1").await, 0);
    assert!(hub.topics_for(&conn_id).await.is_empty());

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket should close after drop");
}
