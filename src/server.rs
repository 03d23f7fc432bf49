//! HTTP listener: WebSocket upgrade for the audio socket plus the admin
//! routes. The WebSocket handler is only a bridge: it shovels socket frames
//! into the session supervisor's inbound channel and supervisor messages
//! back out, so the session logic never touches the transport type.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::admin;
use crate::audio_logger::AudioLogConfig;
use crate::dispatcher::PoolHealth;
use crate::session::{run_session, Inbound, SessionContext, SessionCounter};

/// Messages buffered between the bridge tasks and the supervisor.
const CHANNEL_DEPTH: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionCounter>,
    pub active_sessions: Arc<AtomicUsize>,
    pub session_ctx: SessionContext,
    pub pool_health: Arc<PoolHealth>,
    pub audio_log_config: Arc<RwLock<AudioLogConfig>>,
    pub model_loaded: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(audio_ws))
        .route("/health", get(admin::health))
        .route(
            "/config/audio-log",
            get(admin::get_audio_log).post(admin::set_audio_log),
        )
        .route("/logs/audio/list", get(admin::list_logs))
        .with_state(state)
}

/// `GET /ws`: upgrade to the audio socket.
async fn audio_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_audio_socket(socket, state))
}

async fn handle_audio_socket(socket: WebSocket, state: AppState) {
    let id = state.sessions.next();
    state.active_sessions.fetch_add(1, Ordering::Relaxed);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(CHANNEL_DEPTH);
    let (out_tx, mut out_rx) = mpsc::channel(CHANNEL_DEPTH);

    // Ingest: socket frames → supervisor events. A clean Close becomes the
    // implicit end-mark; a transport error just drops the sender, which the
    // supervisor reads as an abrupt disconnect.
    let ingest = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            let event = match message {
                Ok(Message::Text(text)) => Inbound::Text(text.to_string()),
                Ok(Message::Binary(data)) => Inbound::Binary(data.to_vec()),
                Ok(Message::Close(_)) => {
                    let _ = in_tx.send(Inbound::Closed).await;
                    break;
                }
                Ok(_) => continue, // ping/pong
                Err(e) => {
                    debug!(session_id = id.0, error = %e, "socket read error");
                    break;
                }
            };
            if in_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    // Egress: supervisor messages → JSON text frames, then a server Close
    // once the supervisor is done.
    let egress = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_tx
                .send(Message::Text(message.to_json().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    run_session(id, state.session_ctx.clone(), in_rx, out_tx).await;

    // The supervisor dropped its outbound sender, so egress flushes its
    // queue and closes the socket; ingest has nothing left to feed.
    ingest.abort();
    let _ = egress.await;

    state.active_sessions.fetch_sub(1, Ordering::Relaxed);
}
