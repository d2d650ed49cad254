//! Connection handlers for the FleetHub server.
//!
//! This module handles the connection lifecycle and event processing.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json,
};
use bytes::BytesMut;
use fleethub_core::connection::outbound_channel_with_capacity;
use fleethub_core::{
    AuthGate, ConnectionId, ConnectionInfo, Dispatched, Handshake, Router, StatsReporter,
};
use fleethub_protocol::{codec, Encoded, InboundEvent, OutboundEvent, ProtocolError, WireFormat};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Disconnect reasons reported to the registry.
pub mod reasons {
    pub const TRANSPORT_CLOSE: &str = "transport close";
    pub const TRANSPORT_ERROR: &str = "transport error";
    pub const PING_TIMEOUT: &str = "ping timeout";
    pub const SEND_FAILED: &str = "server send failed";
    pub const SHUTTING_DOWN: &str = "server shutting down";
}

/// Shared server state.
pub struct AppState {
    /// The event router.
    pub router: Arc<Router>,
    /// Connection admission.
    pub gate: AuthGate,
    /// Server configuration.
    pub config: Config,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            router: Arc::new(Router::with_config(config.router_config())),
            gate: config.auth_gate(),
            config,
            shutdown,
        }
    }

    /// Ask every open connection to close.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
    format: Option<String>,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = app(Arc::clone(&state));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Shutting down, closing connections");
        state.shutdown();
    })
    .await
    .context("Server error")?;

    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let reporter = StatsReporter::spawn(
        Arc::clone(&state.router),
        config.stats_interval(),
        metrics::record_stats,
    );

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("FleetHub server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );
    info!(policy = %state.gate.policy(), "Auth gate configured");

    let result = serve(listener, state, shutdown).await;
    reporter.abort();
    result
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "stats": state.router.stats(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    // Soft limit: upgrades accepted concurrently may briefly overshoot it.
    if state.router.at_capacity() {
        warn!(remote = %remote_addr, "Connection limit reached, refusing upgrade");
        metrics::record_error("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    let format = match params.format.as_deref().map(str::parse::<WireFormat>) {
        None => WireFormat::default(),
        Some(Ok(format)) => format,
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let handshake = handshake_from(params.token, &headers);
    match state.gate.admit(&handshake).await {
        Ok(admission) => {
            debug!(
                remote = %remote_addr,
                token_present = admission.token_present,
                subject = ?admission.subject,
                "Connection admitted"
            );
        }
        Err(e) => {
            metrics::record_error("auth");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    }

    let mut info = ConnectionInfo::new().with_remote_addr(remote_addr);
    if let Some(user_agent) = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    {
        info = info.with_user_agent(user_agent);
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, info, format))
}

/// The `token` query parameter wins over an `Authorization: Bearer` header.
fn handshake_from(query_token: Option<String>, headers: &HeaderMap) -> Handshake {
    let handshake = Handshake::new(query_token);
    if handshake.token.is_some() {
        return handshake;
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(Handshake::from_authorization)
        .unwrap_or_default()
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    info: ConnectionInfo,
    format: WireFormat,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (tx, mut outbound) =
        outbound_channel_with_capacity(state.config.limits.outbound_queue_capacity);
    let connection_id = state.router.connect(info, tx).id;

    debug!(connection = %connection_id, format = %format, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let heartbeat = &state.config.heartbeat;
    // A peer that stops reading must not stall the loop past the idle timeout.
    let send_limit = heartbeat.timeout();
    let mut ping_ticker = time::interval_at(Instant::now() + heartbeat.interval(), heartbeat.interval());
    ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let mut shutdown = state.shutdown.subscribe();
    // Observe a shutdown that started before this connection subscribed.
    shutdown.mark_changed();

    let reason = loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_ok() && !*shutdown.borrow_and_update() {
                    continue;
                }
                let frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: reasons::SHUTTING_DOWN.into(),
                };
                let _ = send_message(&mut sender, Message::Close(Some(frame)), send_limit).await;
                break reasons::SHUTTING_DOWN;
            }

            // Events routed to this connection
            Some(event) = outbound.recv() => {
                if let Err(e) = send_event(&mut sender, &event, format, send_limit).await {
                    debug!(connection = %connection_id, error = %e, "Send failed");
                    break reasons::SEND_FAILED;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let message = match msg {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        state.router.transport_error(&connection_id, &e);
                        metrics::record_error("websocket");
                        break reasons::TRANSPORT_ERROR;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break reasons::TRANSPORT_CLOSE;
                    }
                };
                last_seen = Instant::now();

                match message {
                    Message::Text(text) => match codec::decode_json::<InboundEvent>(&text) {
                        Ok(event) => dispatch_event(&state, &connection_id, event),
                        Err(e) => drop_undecodable(&connection_id, &e),
                    },
                    Message::Binary(data) => {
                        read_buffer.extend_from_slice(&data);
                        loop {
                            match codec::decode_from::<InboundEvent>(&mut read_buffer) {
                                Ok(Some(event)) => dispatch_event(&state, &connection_id, event),
                                Ok(None) => break,
                                Err(e @ ProtocolError::FrameTooLarge(_)) => {
                                    drop_undecodable(&connection_id, &e);
                                    read_buffer.clear();
                                    break;
                                }
                                Err(e) => drop_undecodable(&connection_id, &e),
                            }
                        }
                    }
                    Message::Ping(data) => {
                        if send_message(&mut sender, Message::Pong(data), send_limit).await.is_err() {
                            break reasons::SEND_FAILED;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break reasons::TRANSPORT_CLOSE;
                    }
                }
            }

            _ = ping_ticker.tick() => {
                if last_seen.elapsed() >= heartbeat.timeout() {
                    debug!(connection = %connection_id, "Heartbeat timed out");
                    break reasons::PING_TIMEOUT;
                }
                if send_message(&mut sender, Message::Ping(Vec::new()), send_limit).await.is_err() {
                    break reasons::SEND_FAILED;
                }
            }
        }
    };

    state.router.disconnect(&connection_id, reason);
    metrics::set_driver_bindings(state.router.registry().binding_count());

    debug!(connection = %connection_id, reason = reason, "WebSocket disconnected");
}

/// Route one decoded event and record its metrics.
fn dispatch_event(state: &AppState, connection_id: &ConnectionId, event: InboundEvent) {
    let start = Instant::now();
    metrics::record_event(event.kind());

    match state.router.dispatch(connection_id, event) {
        Ok(Dispatched::Authenticated(_)) => {
            metrics::set_driver_bindings(state.router.registry().binding_count());
        }
        Ok(Dispatched::Broadcast { recipients } | Dispatched::GroupSend { recipients, .. }) => {
            metrics::record_broadcast(recipients);
        }
        Ok(Dispatched::Joined { .. }) => {}
        Err(e) => metrics::record_error(metrics::router_error_type(&e)),
    }

    metrics::record_dispatch_latency(start.elapsed().as_secs_f64());
}

fn drop_undecodable(connection_id: &ConnectionId, error: &ProtocolError) {
    debug!(connection = %connection_id, error = %error, "Dropping undecodable message");
    metrics::record_error("decode");
}

/// Send an event to the WebSocket in the connection's wire format.
///
/// An event that fails to encode is logged and skipped.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &OutboundEvent,
    format: WireFormat,
    limit: Duration,
) -> Result<()> {
    let message = match format.encode(event) {
        Ok(Encoded::Text(text)) => Message::Text(text),
        Ok(Encoded::Binary(data)) => Message::Binary(data.to_vec()),
        Err(e) => {
            error!(event = %event.kind(), error = %e, "Failed to encode event");
            metrics::record_error("encode");
            return Ok(());
        }
    };

    send_message(sender, message, limit).await
}

/// Send one message, giving up after `limit`.
async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: Message,
    limit: Duration,
) -> Result<()> {
    time::timeout(limit, sender.send(message))
        .await
        .context("Send timed out")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_handshake_prefers_query_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        let handshake = handshake_from(Some("from-query".into()), &headers);
        assert_eq!(handshake.token.as_deref(), Some("from-query"));

        let handshake = handshake_from(None, &headers);
        assert_eq!(handshake.token.as_deref(), Some("from-header"));

        // An empty query token falls back to the header.
        let handshake = handshake_from(Some(String::new()), &headers);
        assert_eq!(handshake.token.as_deref(), Some("from-header"));

        assert!(handshake_from(None, &HeaderMap::new()).token.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_observed_by_late_subscribers() {
        let state = AppState::new(Config::default());
        state.shutdown();

        let mut rx = state.shutdown.subscribe();
        rx.mark_changed();
        assert!(rx.changed().await.is_ok());
        assert!(*rx.borrow_and_update());
    }

    #[test]
    fn test_app_state_uses_config_limits() {
        let mut config = Config::default();
        config.limits.max_connections = 0;
        let state = AppState::new(config);
        assert!(state.router.at_capacity());
    }
}
