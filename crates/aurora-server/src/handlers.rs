//! Connection handlers for Aurora server.
//!
//! This module handles the WebSocket upgrade, the per-connection socket task
//! and the translation between wire frames and the messenger.

use crate::config::{Config, StorageBackend};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use aurora_core::{
    Connection, Identity, MemoryProvider, Messenger, SessionValidator, SledProvider,
    StorageProvider, StoredSessions, GLOBAL_ROOM,
};
use aurora_protocol::{codec, Frame};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The messenger.
    pub messenger: Messenger,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state over explicit collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        provider: Arc<dyn StorageProvider>,
        sessions: Arc<dyn SessionValidator>,
    ) -> Self {
        let messenger = Messenger::new(provider, sessions, config.messenger());
        Self { messenger, config }
    }

    /// Create app state from configuration, opening the storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if storage or the session store cannot be opened.
    pub async fn from_config(config: Config) -> Result<Self> {
        let provider: Arc<dyn StorageProvider> = match config.storage.backend {
            StorageBackend::Memory => {
                warn!("Using in-memory storage; messages are lost on restart");
                Arc::new(MemoryProvider::new())
            }
            StorageBackend::Sled => Arc::new(
                SledProvider::new(&config.storage.dir, config.storage.extension.clone())
                    .with_context(|| {
                        format!("Failed to open storage at {}", config.storage.dir.display())
                    })?
                    .with_capacity(config.storage.max_open_units),
            ),
        };

        let sessions = StoredSessions::open(provider.as_ref(), config.session.cookie_name.clone())
            .await
            .context("Failed to open session store")?;

        Ok(Self::new(config, provider, Arc::new(sessions)))
    }

    /// Number of registered connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.messenger.rooms().member_count(GLOBAL_ROOM)
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::from_config(config).await?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Aurora server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.active_connections(),
        "users_online": state.messenger.presence().count(),
    }))
}

/// WebSocket upgrade handler.
///
/// The session is checked before upgrading; a request without one never
/// reaches the messaging protocol.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.active_connections() >= state.config.limits.max_connections {
        warn!("Connection limit reached");
        metrics::record_rejection("capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let identity = match state.messenger.handshake(&headers).await {
        Ok(identity) => identity,
        Err(e) => {
            metrics::record_rejection("unauthenticated");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, identity))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut conn, mut deliveries) = match state.messenger.connect(identity) {
        Ok(registered) => registered,
        Err(e) => {
            error!(error = %e, "Failed to register connection");
            metrics::record_error("register");
            return;
        }
    };
    metrics::set_users_online(state.messenger.presence().count());

    debug!(connection = %conn.id(), user = %conn.user_id(), "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let interval = Duration::from_millis(state.config.heartbeat.interval_ms);
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Deliveries queued on this connection by room emits
            Some(delivery) = deliveries.recv() => {
                let frames = state.messenger.handle_delivery(&conn, &delivery).await;
                if send_frames(&mut sender, &frames).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(connection = %conn.id(), "Binary frame is not UTF-8");
                            metrics::record_error("decode");
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %conn.id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %conn.id(), "WebSocket stream ended");
                        break;
                    }
                };

                last_seen = Instant::now();
                let start = std::time::Instant::now();
                let replies = handle_text(&state, &conn, &text).await;
                metrics::record_latency(start.elapsed().as_secs_f64());

                if send_frames(&mut sender, &replies).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    info!(connection = %conn.id(), "Connection timed out");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    conn.close();
    metrics::set_users_online(state.messenger.presence().count());

    // Pushes accepted before the close still have to reach the mailbox.
    let drained = state.messenger.drain(&conn, &mut deliveries).await;
    if drained > 0 {
        debug!(connection = %conn.id(), deliveries = drained, "Persisted queued deliveries");
    }

    debug!(connection = %conn.id(), "WebSocket disconnected");
}

/// Decode a text frame and hand it to the messenger.
///
/// Undecodable frames are logged and skipped; they never end the connection.
async fn handle_text(state: &AppState, conn: &Connection, text: &str) -> Vec<Frame> {
    match codec::decode(text) {
        Ok(frame) => {
            metrics::record_frame(frame.event(), text.len(), "inbound");
            state.messenger.handle_frame(conn, frame).await
        }
        Err(e) => {
            warn!(connection = %conn.id(), error = %e, "Dropping undecodable frame");
            metrics::record_error("decode");
            Vec::new()
        }
    }
}

/// Send frames to the WebSocket.
async fn send_frames(sender: &mut SplitSink<WebSocket, Message>, frames: &[Frame]) -> Result<()> {
    for frame in frames {
        let data = match codec::encode(frame) {
            Ok(data) => data,
            Err(e) => {
                error!(event = %frame.event(), error = %e, "Failed to encode frame");
                metrics::record_error("encode");
                continue;
            }
        };
        metrics::record_frame(frame.event(), data.len(), "outbound");
        metrics::record_outcome(frame);
        sender.send(Message::Text(data)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_core::{Bucket, SessionRecord};
    use aurora_protocol::{ChatMessage, EventName};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server() -> (SocketAddr, Arc<AppState>) {
        let provider = Arc::new(MemoryProvider::new());
        let sessions = StoredSessions::open(provider.as_ref(), "aurora")
            .await
            .unwrap();
        for user in ["alice", "bob"] {
            let record = SessionRecord {
                user_id: user.to_string(),
                display_name: user.to_uppercase(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            };
            sessions.insert(&format!("{user}-token"), &record).await.unwrap();
        }

        let state = Arc::new(AppState::new(
            Config::default(),
            provider,
            Arc::new(sessions),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (addr, state)
    }

    async fn connect(addr: SocketAddr, cookie: Option<&str>) -> Result<Client, tungstenite::Error> {
        let mut request = format!("ws://{addr}/ws").into_client_request()?;
        if let Some(cookie) = cookie {
            request
                .headers_mut()
                .insert("cookie", HeaderValue::from_str(cookie).unwrap());
        }
        connect_async(request).await.map(|(ws, _)| ws)
    }

    async fn connect_user(addr: SocketAddr, state: &AppState, user: &str) -> Client {
        let client = connect(addr, Some(&format!("aurora={user}-token")))
            .await
            .unwrap();
        // Registration happens in the upgraded task; wait for it.
        for _ in 0..100 {
            if state.messenger.presence().exists(user) {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{user} never registered");
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return text;
            }
        }
    }

    async fn next_frame(client: &mut Client) -> Frame {
        codec::decode(&next_text(client).await).unwrap()
    }

    async fn send(client: &mut Client, frame: &Frame) {
        let text = codec::encode(frame).unwrap();
        client.send(WsMessage::Text(text)).await.unwrap();
    }

    #[tokio::test]
    async fn test_online_delivery() {
        let (addr, state) = start_server().await;
        let mut alice = connect_user(addr, &state, "alice").await;
        let mut bob = connect_user(addr, &state, "bob").await;

        send(&mut alice, &Frame::Send(ChatMessage::new("alice", "bob", "hi"))).await;

        let reply = next_frame(&mut alice).await;
        assert_eq!(reply.event(), EventName::SendSuccess);
        assert_eq!(reply.message().unwrap().text, "hi");

        let pushed = next_frame(&mut bob).await;
        assert_eq!(pushed.event(), EventName::Receive);
        let received = pushed.message().unwrap();
        assert_eq!(received.text, "hi");
        assert_eq!(received.sender_name, "ALICE");

        assert_eq!(next_frame(&mut bob).await.event(), EventName::MessageInbox);
    }

    #[tokio::test]
    async fn test_offline_delivery() {
        let (addr, state) = start_server().await;
        let mut alice = connect_user(addr, &state, "alice").await;

        send(&mut alice, &Frame::Send(ChatMessage::new("alice", "bob", "hi"))).await;
        assert_eq!(next_frame(&mut alice).await.event(), EventName::SendSuccess);

        let inbox = state
            .messenger
            .mailboxes()
            .for_user("bob")
            .await
            .unwrap()
            .list(Bucket::Inbox)
            .await
            .unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].text, "hi");
    }

    #[tokio::test]
    async fn test_handshake_without_session_is_refused() {
        let (addr, state) = start_server().await;

        for cookie in [None, Some("aurora=forged")] {
            match connect(addr, cookie).await {
                Err(tungstenite::Error::Http(response)) => {
                    assert_eq!(response.status().as_u16(), 401);
                }
                other => panic!("Expected 401, got {:?}", other.map(|_| ())),
            }
        }

        assert!(state.messenger.presence().is_empty());
        assert_eq!(state.messenger.rooms().stats().room_count, 0);
    }

    #[tokio::test]
    async fn test_disconnect_clears_presence() {
        let (addr, state) = start_server().await;
        let mut alice = connect_user(addr, &state, "alice").await;
        assert_eq!(state.active_connections(), 1);

        alice.close(None).await.unwrap();
        for _ in 0..100 {
            if !state.messenger.presence().exists("alice") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!state.messenger.presence().exists("alice"));
        assert_eq!(state.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_garbage_frame_keeps_connection() {
        let (addr, state) = start_server().await;
        let mut alice = connect_user(addr, &state, "alice").await;

        alice.send(WsMessage::Text("nonsense".into())).await.unwrap();
        alice
            .send(WsMessage::Text("send {not json".into()))
            .await
            .unwrap();

        send(&mut alice, &Frame::Send(ChatMessage::new("alice", "bob", "still here"))).await;
        assert_eq!(next_frame(&mut alice).await.event(), EventName::SendSuccess);
    }

    #[tokio::test]
    async fn test_largest_send_is_acknowledged() {
        let (addr, state) = start_server().await;
        let mut alice = connect_user(addr, &state, "alice").await;

        let empty = codec::encode(&Frame::Send(ChatMessage::new("alice", "bob", ""))).unwrap();
        let text = "x".repeat(codec::MAX_FRAME_SIZE - empty.len());
        send(&mut alice, &Frame::Send(ChatMessage::new("alice", "bob", text.clone()))).await;

        // The stamped reply outgrows the inbound limit, so read it raw.
        let reply = next_text(&mut alice).await;
        assert!(reply.len() > codec::MAX_FRAME_SIZE);
        let (event, payload) = reply.split_once(' ').unwrap();
        assert_eq!(event, "sendSuccess");
        let sent: ChatMessage = serde_json::from_str(payload).unwrap();
        assert_eq!(sent.text, text);
        assert!(sent.has_id());
    }
}
