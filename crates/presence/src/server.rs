use crate::auth::HttpAuthenticator;
use crate::config::PresenceServerConfig;
use crate::dispatcher::{Connection, Dispatcher};
use crate::registry::ConnectionRegistry;
use crate::session::{encode_frame, Frame, Session};
use crate::signaling::{SignalingRelay, WebRtcNegotiatorFactory};

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use shared::{HealthDto, ServerEnvelope};
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, instrument, warn};

/// How long the writer gets to flush queued frames after the read side ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    dispatcher: Dispatcher,
    outbound_buffer: usize,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, outbound_buffer: usize) -> Self {
        Self {
            dispatcher,
            outbound_buffer: outbound_buffer.max(1),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    room_id: Option<String>,
    user_id: Option<String>,
}

impl ConnectParams {
    /// Both identity and room, with blanks treated as absent.
    fn identity(self) -> Option<(String, String)> {
        let user_id = self.user_id.filter(|s| !s.trim().is_empty())?;
        let room_id = self.room_id.filter(|s| !s.trim().is_empty())?;
        Some((user_id, room_id))
    }
}

pub async fn run_server(config: PresenceServerConfig) -> anyhow::Result<()> {
    let registry = Arc::new(ConnectionRegistry::new(config.prune_empty_rooms));
    let auth = Arc::new(HttpAuthenticator::new(
        config.auth_base_url.clone(),
        config.auth_timeout,
    )?);
    let factory = Arc::new(WebRtcNegotiatorFactory::new(config.stun_urls.clone())?);
    let relay = Arc::new(SignalingRelay::new(Arc::clone(&registry), factory));
    let state = AppState::new(Dispatcher::new(registry, relay, auth), config.outbound_buffer);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(address = %config.listen_addr, "Starting presence server");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(healthcheck))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    (StatusCode::OK, "Server OK!")
}

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.dispatcher.registry();
    let body = HealthDto {
        rooms: registry.room_count().await,
        sessions: registry.session_count().await,
    };
    (StatusCode::OK, Json(body))
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, params: ConnectParams) {
    let Some((user_id, room_id)) = params.identity() else {
        warn!("rejecting connection without userId and roomId");
        let refusal = ServerEnvelope::error("userId and roomId are required");
        if let Ok(frame) = encode_frame(&refusal) {
            let _ = socket.send(Message::Text(frame.to_string())).await;
        }
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    run_connection(socket, state, user_id, room_id).await;
}

#[instrument(skip_all, fields(session_id = %user_id, room_id = %room_id))]
async fn run_connection(socket: WebSocket, state: AppState, user_id: String, room_id: String) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (session, outbound) = Session::channel(user_id, state.outbound_buffer);
    let mut conn = Connection::new(session, room_id);
    let mut writer = tokio::spawn(write_outbound(ws_tx, outbound));
    info!("client connected");

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!("ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                info!("client sent close frame");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(e) => {
                warn!(error = %e, "websocket read failed");
                break;
            }
        };

        if let Err(e) = state.dispatcher.handle_frame(&mut conn, &text).await {
            warn!(error = %e, "closing connection");
            break;
        }
    }

    state.dispatcher.disconnect(&mut conn).await;
    // Last sender gone: the writer drains what is queued, then stops.
    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Drain the outbound queue into the socket until either side closes.
async fn write_outbound<S>(mut sink: S, mut outbound: mpsc::Receiver<Frame>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
            debug!(error = %e, "websocket write failed");
            return;
        }
    }
    let _ = sink.close().await;
}
