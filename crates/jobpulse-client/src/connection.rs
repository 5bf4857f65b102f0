use crate::bus::{EventBus, InboundEvent};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::{lock, Identity};
use futures_util::{SinkExt, StreamExt};
use jobpulse_core::topics::TopicRegistry;
use jobpulse_core::wire::{decode_frame, encode_frame, HelloPayload, WireEnvelope, WireMsg};
use jobpulse_core::ConnectionState;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct SessionHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    bus: EventBus,
    topics: Mutex<TopicRegistry>,
    identity: Mutex<Option<Identity>>,
    connection_id: Mutex<Option<String>>,
    control_tx: Mutex<Option<mpsc::UnboundedSender<WireMsg>>>,
    state_tx: watch::Sender<ConnectionState>,
    session: AsyncMutex<Option<SessionHandle>>,
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

/// Owns the authenticated push connection.
///
/// Cloning is cheap and every clone drives the same connection; hand clones
/// to trackers instead of reaching for a global.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                bus: EventBus::new(),
                topics: Mutex::new(TopicRegistry::new()),
                identity: Mutex::new(None),
                connection_id: Mutex::new(None),
                control_tx: Mutex::new(None),
                state_tx,
                session: AsyncMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Server-assigned id of the live connection instance.
    pub fn connection_id(&self) -> Option<String> {
        lock(&self.inner.connection_id).clone()
    }

    pub fn active_topics(&self) -> Vec<String> {
        lock(&self.inner.topics).active().map(str::to_string).collect()
    }

    pub fn joined_topics(&self) -> Vec<String> {
        lock(&self.inner.topics).joined().map(str::to_string).collect()
    }

    /// Opens the connection and performs the auth handshake. Failures are
    /// returned, not retried.
    ///
    /// A no-op while a session is connected. If the running session is between
    /// reconnect attempts, `identity` is handed to those attempts and the call
    /// waits for the outcome: `Ok` once the session is back, or a fresh
    /// handshake after the session gave up.
    pub async fn connect(&self, identity: Identity) -> Result<(), ClientError> {
        if identity.token.trim().is_empty() {
            warn!(event = "connect_rejected", reason = "missing_credential");
            return Err(ClientError::MissingCredential);
        }

        let mut session = loop {
            let mut session = self.inner.session.lock().await;
            let running = session
                .as_ref()
                .is_some_and(|handle| !handle.task.is_finished());
            if !running {
                break session;
            }
            match self.state() {
                ConnectionState::Connected => {
                    debug!(event = "connect_noop", state = %ConnectionState::Connected);
                    return Ok(());
                }
                ConnectionState::Connecting => {
                    *lock(&self.inner.identity) = Some(identity.clone());
                    drop(session);
                    debug!(event = "connect_waiting", reason = "reconnecting");
                    let mut states = self.subscribe_state();
                    let _ = states
                        .wait_for(|state| *state != ConnectionState::Connecting)
                        .await;
                }
                ConnectionState::Disconnected => {
                    // The session gave up and its task is exiting.
                    if let Some(handle) = session.take() {
                        let _ = handle.task.await;
                    }
                    break session;
                }
            }
        };

        *lock(&self.inner.identity) = Some(identity.clone());
        self.inner.state_tx.send_replace(ConnectionState::Connecting);

        let (mut ws, connection_id) = match open_session(&self.inner.config, &identity).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "connect_failed", error = %err);
                self.inner.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *lock(&self.inner.control_tx) = Some(control_tx);
        if let Err(err) = establish(&self.inner, &mut ws, connection_id).await {
            warn!(event = "connect_failed", error = %err);
            *lock(&self.inner.control_tx) = None;
            self.inner.state_tx.send_replace(ConnectionState::Disconnected);
            return Err(err);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            run_session(inner, ws, control_rx, shutdown_rx).await;
        });
        *session = Some(SessionHandle {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Tears the connection down and forgets the identity and every topic.
    pub async fn disconnect(&self) {
        let handle = self.inner.session.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
        }
        *lock(&self.inner.control_tx) = None;
        *lock(&self.inner.identity) = None;
        *lock(&self.inner.connection_id) = None;
        lock(&self.inner.topics).clear();
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
        info!(event = "disconnected", reason = "requested");
    }

    /// Replaces the credential used by future handshakes (reconnects).
    pub fn refresh_identity(&self, identity: Identity) {
        *lock(&self.inner.identity) = Some(identity);
    }

    pub fn join(&self, topic: &str) {
        let newly_active = lock(&self.inner.topics).join(topic);
        if newly_active {
            self.send_control(WireMsg::join(topic));
        }
    }

    pub fn leave(&self, topic: &str) {
        let was_active = lock(&self.inner.topics).leave(topic);
        if was_active {
            self.send_control(WireMsg::leave(topic));
        }
    }

    /// Joins `topic` and leaves it again when the guard is dropped.
    pub fn hold_topic(&self, topic: &str) -> TopicGuard {
        self.join(topic);
        TopicGuard {
            manager: self.clone(),
            topic: topic.to_string(),
        }
    }

    fn send_control(&self, msg: WireMsg) {
        if let Some(tx) = lock(&self.inner.control_tx).as_ref() {
            let _ = tx.send(msg);
        }
    }
}

pub struct TopicGuard {
    manager: ConnectionManager,
    topic: String,
}

impl TopicGuard {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        self.manager.leave(&self.topic);
    }
}

async fn open_session(
    config: &ClientConfig,
    identity: &Identity,
) -> Result<(HubSocket, String), ClientError> {
    match tokio::time::timeout(config.handshake_timeout, handshake(config, identity)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::HandshakeTimeout),
    }
}

async fn handshake(
    config: &ClientConfig,
    identity: &Identity,
) -> Result<(HubSocket, String), ClientError> {
    let (mut ws, _) = connect_async(config.hub_url.as_str()).await?;
    let hello = WireEnvelope::new(WireMsg::Hello(HelloPayload {
        client_id: identity.client_id.clone(),
        token: identity.token.clone(),
    }));
    ws.send(Message::Text(encode_frame(&hello, config.max_frame_bytes)?))
        .await?;

    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let envelope: WireEnvelope = decode_frame(&text, config.max_frame_bytes)?;
        match envelope.msg {
            WireMsg::Welcome(payload) => return Ok((ws, payload.connection_id)),
            WireMsg::Rejected(payload) => {
                let _ = ws.close(None).await;
                return Err(ClientError::Rejected {
                    code: payload.code,
                    message: payload.message,
                });
            }
            other => debug!(event = "handshake_skip", kind = other.kind()),
        }
    }
    Err(ClientError::ClosedDuringHandshake)
}

/// Re-joins every active topic on a freshly authenticated socket and marks
/// the connection usable.
async fn establish(
    inner: &Inner,
    ws: &mut HubSocket,
    connection_id: String,
) -> Result<(), ClientError> {
    let pending = {
        let mut topics = lock(&inner.topics);
        let pending = topics.pending_rejoin();
        for topic in &pending {
            topics.mark_joined(topic);
        }
        pending
    };
    for topic in &pending {
        send_msg(inner, ws, WireMsg::join(topic.as_str())).await?;
    }
    info!(
        event = "connected",
        connection_id = %connection_id,
        rejoined = pending.len()
    );
    *lock(&inner.connection_id) = Some(connection_id);
    inner.state_tx.send_replace(ConnectionState::Connected);
    Ok(())
}

async fn send_msg(inner: &Inner, ws: &mut HubSocket, msg: WireMsg) -> Result<(), ClientError> {
    let frame = encode_frame(&WireEnvelope::new(msg), inner.config.max_frame_bytes)?;
    ws.send(Message::Text(frame)).await?;
    Ok(())
}

async fn run_session(
    inner: Arc<Inner>,
    mut ws: HubSocket,
    mut control_rx: mpsc::UnboundedReceiver<WireMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match pump(&inner, &mut ws, &mut control_rx, &mut shutdown).await {
            SessionEnd::Shutdown => {
                let _ = ws.close(None).await;
                break;
            }
            SessionEnd::Dropped(reason) => {
                warn!(event = "connection_dropped", reason = %reason);
                lock(&inner.topics).connection_lost();
                *lock(&inner.connection_id) = None;
                inner.state_tx.send_replace(ConnectionState::Connecting);
            }
        }

        match reconnect(&inner, &mut shutdown).await {
            Some(next) => ws = next,
            None => {
                *lock(&inner.control_tx) = None;
                inner.state_tx.send_replace(ConnectionState::Disconnected);
                break;
            }
        }
    }
}

async fn pump(
    inner: &Inner,
    ws: &mut HubSocket,
    control_rx: &mut mpsc::UnboundedReceiver<WireMsg>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(inner, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Dropped("closed".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                }
            }
            Some(msg) = control_rx.recv() => {
                let should_send = {
                    let mut topics = lock(&inner.topics);
                    match &msg {
                        WireMsg::JoinTopic(payload) => topics.mark_joined(&payload.topic),
                        WireMsg::LeaveTopic(payload) => topics.mark_left(&payload.topic),
                        _ => true,
                    }
                };
                if should_send {
                    if let Err(err) = send_msg(inner, ws, msg).await {
                        return SessionEnd::Dropped(err.to_string());
                    }
                }
            }
        }
    }
}

fn handle_frame(inner: &Inner, text: &str) {
    let envelope: WireEnvelope = match decode_frame(text, inner.config.max_frame_bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(event = "frame_decode_error", error = %err);
            return;
        }
    };
    match envelope.msg {
        WireMsg::Event(payload) => {
            let delivered = inner.bus.publish(InboundEvent {
                topic: payload.topic,
                event: payload.event,
                payload: payload.payload,
            });
            debug!(event = "event_received", delivered);
        }
        WireMsg::Error(payload) | WireMsg::Rejected(payload) => {
            warn!(event = "hub_error", code = %payload.code, message = %payload.message);
        }
        other => debug!(event = "frame_ignored", kind = other.kind()),
    }
}

async fn reconnect(inner: &Inner, shutdown: &mut watch::Receiver<bool>) -> Option<HubSocket> {
    let policy = &inner.config.reconnect;
    let mut delay = policy.initial_delay;
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return None,
        }
        let Some(identity) = lock(&inner.identity).clone() else {
            return None;
        };

        let opened = tokio::select! {
            opened = open_session(&inner.config, &identity) => opened,
            _ = shutdown.changed() => return None,
        };
        match opened {
            Ok((mut ws, connection_id)) => match establish(inner, &mut ws, connection_id).await {
                Ok(()) => {
                    info!(event = "reconnected", attempt);
                    return Some(ws);
                }
                Err(err) => {
                    lock(&inner.topics).connection_lost();
                    warn!(event = "reconnect_failed", attempt, error = %err);
                }
            },
            Err(err) => warn!(event = "reconnect_failed", attempt, error = %err),
        }
        delay = policy.next_delay(delay);
    }
    warn!(event = "reconnect_exhausted", attempts = policy.max_attempts);
    None
}
