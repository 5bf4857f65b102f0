//! Development push hub: authenticates websocket clients, tracks which topics
//! each connection joined and fans published events out to topic members.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use jobpulse_core::wire::{
    decode_frame, encode_frame, ErrorPayload, EventPayload, WelcomePayload, WireEnvelope, WireMsg,
    DEFAULT_MAX_FRAME_BYTES,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError,
    },
    time::Duration,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Accepted tokens. Empty accepts any non-empty token.
    pub tokens: HashSet<String>,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            tokens: HashSet::new(),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

struct Client {
    conn_id: String,
    client_id: String,
    sender: mpsc::Sender<Message>,
    kick: watch::Sender<bool>,
}

impl Client {
    async fn send_msg(&self, msg: WireMsg, max_frame_bytes: usize) -> bool {
        match encode_frame(&WireEnvelope::new(msg), max_frame_bytes) {
            Ok(text) => self.sender.send(Message::Text(text)).await.is_ok(),
            Err(err) => {
                warn!(event = "encode_error", conn_id = %self.conn_id, error = %err);
                false
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PublishRequest {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PublishResponse {
    pub recipients: usize,
}

pub struct HubState {
    config: HubConfig,
    tokens: std::sync::RwLock<HashSet<String>>,
    started_at: DateTime<Utc>,
    conn_counter: AtomicU64,
    accepting: AtomicBool,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    members: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            tokens: std::sync::RwLock::new(config.tokens.clone()),
            config,
            started_at: Utc::now(),
            conn_counter: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            clients: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn authorize(&self, token: &str) -> bool {
        if token.trim().is_empty() {
            return false;
        }
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens.is_empty() || tokens.contains(token)
    }

    /// Replaces the accepted tokens. Live connections are not re-checked;
    /// the new set applies from the next handshake.
    pub fn set_tokens(&self, tokens: impl IntoIterator<Item = String>) {
        let mut current = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *current = tokens.into_iter().collect();
        info!(event = "tokens_updated", count = current.len());
    }

    /// While false, websocket upgrades are refused with 503.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Connections currently joined to `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.members
            .read()
            .await
            .get(topic)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    /// Topics the connection `conn_id` is joined to, sorted.
    pub async fn topics_for(&self, conn_id: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .members
            .read()
            .await
            .iter()
            .filter(|(_, members)| members.contains(conn_id))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Sends an `event` frame to every member of `topic`; returns how many
    /// connections it was handed to.
    pub async fn publish(&self, topic: &str, event: &str, payload: Value) -> usize {
        let targets: Vec<Arc<Client>> = {
            let members = self.members.read().await;
            let clients = self.clients.read().await;
            members
                .get(topic)
                .map(|ids| ids.iter().filter_map(|id| clients.get(id).cloned()).collect())
                .unwrap_or_default()
        };
        let mut delivered = 0;
        for client in targets {
            let msg = WireMsg::Event(EventPayload {
                topic: topic.to_string(),
                event: event.to_string(),
                payload: payload.clone(),
            });
            if client.send_msg(msg, self.config.max_frame_bytes).await {
                delivered += 1;
            } else {
                warn!(event = "send_error", conn_id = %client.conn_id);
                self.remove_client(&client, "send_error").await;
            }
        }
        info!(event = "published", topic = topic, name = event, recipients = delivered);
        delivered
    }

    /// Closes every live connection from the server side.
    pub async fn drop_connections(&self) -> usize {
        let clients: Vec<Arc<Client>> = self.clients.read().await.values().cloned().collect();
        for client in &clients {
            let _ = client.kick.send(true);
            self.remove_client(client, "dropped_by_hub").await;
        }
        clients.len()
    }

    async fn register_client(&self, client: Arc<Client>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            client_id = %client.client_id
        );
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        let removed = self.clients.write().await.remove(&client.conn_id).is_some();
        let mut members = self.members.write().await;
        members.retain(|_, ids| {
            ids.remove(&client.conn_id);
            !ids.is_empty()
        });
        if removed {
            info!(
                event = "client_disconnected",
                conn_id = %client.conn_id,
                client_id = %client.client_id,
                reason = reason
            );
        }
    }

    async fn join(&self, client: &Client, topic: &str) {
        let inserted = self
            .members
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(client.conn_id.clone());
        debug!(event = "topic_joined", conn_id = %client.conn_id, topic = topic, inserted);
    }

    async fn leave(&self, client: &Client, topic: &str) {
        let mut members = self.members.write().await;
        if let Some(ids) = members.get_mut(topic) {
            ids.remove(&client.conn_id);
            if ids.is_empty() {
                members.remove(topic);
            }
        }
        debug!(event = "topic_left", conn_id = %client.conn_id, topic = topic);
    }

    async fn send_error(&self, client: &Client, code: &str, message: &str) {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        };
        let _ = client
            .send_msg(WireMsg::Error(payload), self.config.max_frame_bytes)
            .await;
    }

    async fn handle_message(&self, client: &Client, msg: WireMsg) {
        match msg {
            WireMsg::JoinTopic(payload) => self.join(client, &payload.topic).await,
            WireMsg::LeaveTopic(payload) => self.leave(client, &payload.topic).await,
            WireMsg::Hello(_) => {
                self.send_error(client, "unexpected_hello", "unexpected hello")
                    .await;
                warn!(event = "unexpected_hello", conn_id = %client.conn_id);
            }
            other => {
                self.send_error(client, "unknown_message", "unexpected message type")
                    .await;
                warn!(event = "unknown_message", conn_id = %client.conn_id, kind = other.kind());
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let first = match tokio::time::timeout(self.config.handshake_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(_) => return,
            Err(_) => {
                warn!(event = "hello_timeout", remote = %remote);
                return;
            }
        };
        let hello = match decode_frame::<WireEnvelope>(&first, self.config.max_frame_bytes) {
            Ok(WireEnvelope {
                msg: WireMsg::Hello(payload),
                ..
            }) => payload,
            Ok(other) => {
                warn!(event = "expected_hello", remote = %remote, kind = other.msg.kind());
                return;
            }
            Err(err) => {
                warn!(event = "hello_parse", remote = %remote, error = %err);
                return;
            }
        };

        let (kick_tx, mut kick_rx) = watch::channel(false);
        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            client_id: hello.client_id,
            sender: tx.clone(),
            kick: kick_tx,
        });

        if !self.authorize(&hello.token) {
            let rejected = WireMsg::Rejected(ErrorPayload {
                code: "unauthorized".to_string(),
                message: "token not accepted".to_string(),
            });
            let _ = client.send_msg(rejected, self.config.max_frame_bytes).await;
            warn!(event = "handshake_rejected", remote = %remote, client_id = %client.client_id);
            drop(client);
            drop(tx);
            let _ = write_task.await;
            return;
        }

        let welcome = WireMsg::Welcome(WelcomePayload {
            connection_id: client.conn_id.clone(),
        });
        self.register_client(client.clone()).await;
        if !client.send_msg(welcome, self.config.max_frame_bytes).await {
            self.remove_client(&client, "welcome_failed").await;
            return;
        }
        info!(event = "handshake_ok", conn_id = %client.conn_id, client_id = %client.client_id);

        loop {
            let result = tokio::select! {
                _ = kick_rx.changed() => break,
                next = ws_receiver.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };
            let text = match result {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            match decode_frame::<WireEnvelope>(&text, self.config.max_frame_bytes) {
                Ok(envelope) => self.handle_message(&client, envelope.msg).await,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                    self.send_error(&client, "invalid_frame", &err.to_string())
                        .await;
                }
            }
        }

        self.remove_client(&client, "disconnect").await;
        drop(client);
        drop(tx);
        let _ = write_task.await;
    }

    fn health(&self) -> Value {
        serde_json::json!({
            "status": "ok",
            "started_at": self.started_at.to_rfc3339(),
        })
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/publish", post(publish_handler))
        .with_state(hub)
}

/// Serves the hub on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, hub: Arc<HubState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    if !hub.accepting.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

async fn health_handler(State(hub): State<Arc<HubState>>) -> impl IntoResponse {
    let mut body = hub.health();
    body["connections"] = Value::from(hub.connection_count().await);
    Json(body)
}

async fn publish_handler(
    State(hub): State<Arc<HubState>>,
    Json(request): Json<PublishRequest>,
) -> impl IntoResponse {
    let recipients = hub
        .publish(&request.topic, &request.event, request.payload)
        .await;
    Json(PublishResponse { recipients })
}
