//! Connection handlers for the Parley server.
//!
//! This module handles the connection lifecycle: upgrade, the per-connection
//! read/write loop, heartbeats and cleanup.

use crate::config::Config;
use crate::identity::JwtIdentityResolver;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::pg_store::PgStore;
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    ConnectionHandle, ConnectionId, LoggingPushGateway, MemoryStore, Outgoing,
    Router as RelayRouter, Store,
};
use parley_protocol::{codec, ClientEvent, Encoding, ProtocolError, ServerEvent, WireFrame};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Close code sent to a connection replaced by a newer session of its user.
pub const SUPERSEDED_CLOSE_CODE: u16 = 4000;

/// Shared server state.
pub struct AppState {
    /// The event router.
    pub router: RelayRouter,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, router: RelayRouter) -> Self {
        Self { router, config }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store = open_store(&config).await?;
    let identity = Arc::new(JwtIdentityResolver::from_config(&config.auth));
    let router = RelayRouter::new(store, identity, Arc::new(LoggingPushGateway));
    let state = Arc::new(AppState::new(config.clone(), router));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match &config.database.url {
        Some(url) => {
            let store = PgStore::connect(url, config.database.max_connections).await?;
            info!("Connected to PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured, keeping state in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.registry().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "authenticated": stats.authenticated_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let stats = state.router.registry().stats();
    if stats.connection_count >= state.config.limits.max_connections {
        warn!(
            connections = stats.connection_count,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let (handle, mut mailbox) = ConnectionHandle::channel(connection_id.clone());
    if !state.router.connect(handle) {
        error!(connection = %connection_id, "Connection id already registered");
        return;
    }

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies follow the encoding of the last inbound frame.
    let mut encoding = Encoding::Text;

    let heartbeat = state.config.heartbeat.clone();
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat.interval(),
        heartbeat.interval(),
    );
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events queued for this connection by any handler
            outgoing = mailbox.recv() => {
                match outgoing {
                    Some(Outgoing::Event(event)) => {
                        let Some(message) = encode_event(&connection_id, &event, encoding) else {
                            continue;
                        };
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Outgoing::Close) => {
                        info!(connection = %connection_id, "Session superseded, closing");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: SUPERSEDED_CLOSE_CODE,
                                reason: "superseded".into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Text;
                        let decoded = codec::decode_text(&text);
                        dispatch(&state, &connection_id, text.len(), decoded).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::Binary;
                        let decoded = codec::decode_binary(&data);
                        dispatch(&state, &connection_id, data.len(), decoded).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() >= heartbeat.timeout() {
                    info!(connection = %connection_id, "Idle timeout");
                    metrics::record_error("idle_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.router.disconnect(&connection_id).await;
    metrics::set_sessions(state.router.registry().stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

async fn dispatch(
    state: &AppState,
    conn: &ConnectionId,
    bytes: usize,
    decoded: Result<ClientEvent, ProtocolError>,
) {
    let kind = match &decoded {
        Ok(event) => event.kind().as_str(),
        Err(e) if e.is_unknown_kind() => "unknown",
        Err(_) => "malformed",
    };
    metrics::record_frame(bytes, "inbound", kind);

    let start = Instant::now();
    let outcome = state.router.route(conn, decoded).await;
    metrics::record_dispatch(outcome, start.elapsed().as_secs_f64());

    if kind == "auth" {
        metrics::set_sessions(state.router.registry().stats());
    }
}

fn encode_event(conn: &ConnectionId, event: &ServerEvent, encoding: Encoding) -> Option<Message> {
    match codec::encode(event, encoding) {
        Ok(frame) => {
            metrics::record_frame(frame.encoded_len(), "outbound", event.name());
            Some(match frame {
                WireFrame::Text(text) => Message::Text(text),
                WireFrame::Binary(data) => Message::Binary(data.to_vec()),
            })
        }
        Err(e) => {
            error!(connection = %conn, event = event.name(), error = %e, "Failed to encode event");
            metrics::record_error("encode");
            None
        }
    }
}
