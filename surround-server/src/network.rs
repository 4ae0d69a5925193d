//! Network handling for the room server
//!
//! | Path | Description |
//! |------|-------------|
//! | `/ws?roomId=..&username=..` | Room channel (JSON text frames) |
//! | `GET /api/rooms` | Summaries of every room |
//! | `POST /api/rooms` | Create an empty room |
//! | `GET /api/rooms/:room_id` | One room, 404 when unknown |
//! | `GET /health` | Liveness plus room and connection counts |

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use surround_core::network::{RoomId, MAX_FRAME_BYTES};
use surround_core::sync::{ClientMessage, RoomCreated, RoomSummary, ServerMessage};
use surround_core::time::SystemClock;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::coordinator::{deliver, Applied, Outbound, OUTBOUND_CAPACITY};
use crate::metrics::{truncate_client_id, LogLevel, Metrics, ServerStatus};
use crate::registry::{Membership, RoomRegistry, SharedRoom};
use crate::BoxError;

/// Shared state passed to all request handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub metrics: Arc<RwLock<Metrics>>,
    pub ping_interval: Duration,
}

/// Query string of a room connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinParams {
    room_id: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    timestamp: String,
    rooms: usize,
    connections: usize,
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/:room_id", get(get_room))
        .route("/health", get(health))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Serve `app` on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

/// Bind the configured port and run the server until `shutdown` resolves
pub async fn run(
    config: ServerConfig,
    metrics: Arc<RwLock<Metrics>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let registry = Arc::new(RoomRegistry::new(
        Arc::new(SystemClock),
        config.schedule_lead,
        config.spatial,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Failed to bind {}: {}", addr, e));
            return Err(e.into());
        }
    };

    info!("Surround room server listening on http://{}", addr);
    info!(
        "Schedule lead {}ms, spatial tick {}ms",
        config.schedule_lead.as_millis(),
        config.spatial.tick.as_millis()
    );
    {
        let mut m = metrics.write();
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on port {}", config.port));
    }

    let state = AppState {
        registry: Arc::clone(&registry),
        metrics,
        ping_interval: config.ping_interval,
    };
    let result = serve(listener, router(state, &config.allowed_origins), shutdown).await;

    registry.shutdown();
    info!("Server stopped");
    result
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(config: ServerConfig, metrics: Arc<RwLock<Metrics>>) -> Result<(), BoxError> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("surround_server=info".parse()?)
                .add_directive("surround_core=info".parse()?),
        )
        .init();

    run(config, metrics, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// ============================================================================
// REST
// ============================================================================

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.registry.list())
}

async fn create_room(State(state): State<AppState>) -> Json<RoomCreated> {
    let room_id = state.registry.create_room();
    let rooms = state.registry.list();
    {
        let mut m = state.metrics.write();
        m.set_rooms(rooms);
        m.log(LogLevel::Room, format!("Room {} created", room_id));
    }
    Json(RoomCreated {
        room_id: room_id.to_string(),
        created: true,
    })
}

async fn get_room(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    match RoomId::parse(&room_id).and_then(|id| state.registry.summary(&id)) {
        Some(summary) => Json(summary).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Room not found" })),
        )
            .into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
        rooms: state.registry.room_count(),
        connections: state.registry.connection_count(),
    })
}

// ============================================================================
// Room channel
// ============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(room_id) = params.room_id.as_deref().and_then(RoomId::parse) else {
        debug!("Rejecting room connection without a valid roomId");
        return (StatusCode::BAD_REQUEST, "missing or invalid roomId").into_response();
    };
    // Audio uploads arrive as a single text frame
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, room_id, params.username))
}

async fn handle_socket(socket: WebSocket, state: AppState, room_id: RoomId, username: Option<String>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Arc<str>>(OUTBOUND_CAPACITY);
    let Membership { client_id, room } =
        state
            .registry
            .join(&room_id, username.clone(), outbound_tx.clone());
    let rooms = state.registry.list();
    {
        let mut m = state.metrics.write();
        m.set_rooms(rooms);
        m.connection_established(&client_id, room_id.as_str(), username.as_deref());
    }

    let (mut sink, mut stream) = socket.split();

    // Pings double as the server-side RTT probe for the roster
    let mut ping = tokio::time::interval_at(Instant::now() + state.ping_interval, state.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_seq: u64 = 0;
    let mut ping_in_flight: Option<(u64, Instant)> = None;

    loop {
        tokio::select! {
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                    debug!("Send to {} failed: {}", client_id, e);
                    break;
                }
            }
            _ = ping.tick() => {
                ping_seq += 1;
                if sink.send(Message::Ping(ping_seq.to_be_bytes().to_vec())).await.is_err() {
                    break;
                }
                ping_in_flight = Some((ping_seq, Instant::now()));
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // t1 of a clock probe is the receive instant
                    let received_at = state.registry.now_ms();
                    handle_text(&state, &room, &room_id, &client_id, &outbound_tx, &text, received_at);
                }
                Some(Ok(Message::Pong(payload))) => {
                    if let Some((seq, sent_at)) = ping_in_flight {
                        if payload == seq.to_be_bytes() {
                            let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
                            room.lock().record_round_trip(&client_id, rtt_ms);
                            ping_in_flight = None;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error from {}: {}", client_id, e);
                    break;
                }
            },
        }
    }

    let room_closed = state.registry.leave(&room_id, &client_id);
    let rooms = state.registry.list();
    let mut m = state.metrics.write();
    m.set_rooms(rooms);
    m.connection_closed(&client_id, room_id.as_str(), room_closed);
}

fn handle_text(
    state: &AppState,
    room: &SharedRoom,
    room_id: &RoomId,
    client_id: &str,
    outbound: &Outbound,
    text: &str,
    received_at: u64,
) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Dropping malformed frame from {}: {}", client_id, e);
            state.metrics.write().log(
                LogLevel::Warning,
                format!("Malformed frame from {}", truncate_client_id(client_id)),
            );
            return;
        }
    };

    match message {
        ClientMessage::NtpRequest { t0 } => {
            let response = ServerMessage::NtpResponse {
                t0,
                t1: received_at,
                t2: state.registry.now_ms(),
            };
            match response.to_json() {
                Ok(text) => {
                    deliver(client_id, outbound, Arc::from(text));
                    state.metrics.write().ntp_answered();
                }
                Err(e) => warn!("Failed to encode NTP_RESPONSE: {}", e),
            }
        }
        ClientMessage::SpatialAudioStart => {
            if state.registry.start_spatial(room) {
                state
                    .metrics
                    .write()
                    .log(LogLevel::Room, format!("Spatial audio on in {}", room_id));
            }
        }
        message => {
            let kind = message.kind();
            let upload = match &message {
                ClientMessage::UploadAudio {
                    audio_name,
                    audio_buffer,
                    ..
                } => Some((audio_name.clone(), audio_buffer.len())),
                _ => None,
            };

            let applied = room.lock().apply(client_id, message);
            if applied == Applied::Ignored {
                return;
            }

            // Play state, track and sources all show up in the room table
            let rooms = state.registry.list();
            let mut m = state.metrics.write();
            m.set_rooms(rooms);
            match (applied, upload) {
                (Applied::Scheduled, _) => m.action_scheduled(room_id.as_str(), kind),
                (Applied::Updated, Some((name, bytes))) => {
                    m.audio_uploaded(room_id.as_str(), &name, bytes)
                }
                _ => {}
            }
        }
    }
}
