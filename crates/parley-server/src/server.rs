//! HTTP/WebSocket server assembly: router, connection acceptance, and the
//! central frame loop that feeds handler dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use parley_ai::ModelDirectory;
use parley_core::identity::{Identity, Role};
use parley_core::ids::ParticipantId;
use parley_service::{AiOrchestrator, ConversationService};

use crate::channels::{handle_ws_connection, start_cleanup_task, ChannelId, ChannelRegistry};
use crate::handlers::{dispatch, HandlerState};
use crate::rpc::{WireRequest, WireResponse};

const FRAME_QUEUE_SIZE: usize = 1024;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// TCP port to bind. 0 picks an ephemeral port.
    pub port: u16,
    /// Per-channel outbound queue depth before frames are dropped.
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080, max_send_queue: 256 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    handlers: Arc<HandlerState>,
    frames: mpsc::Sender<(ChannelId, String)>,
}

/// A running server. Dropping the handle does not stop it; call
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub port: u16,
    pub registry: Arc<ChannelRegistry>,
    serve_task: tokio::task::JoinHandle<()>,
    frame_task: tokio::task::JoinHandle<()>,
    cleanup_task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.serve_task.abort();
        self.frame_task.abort();
        self.cleanup_task.abort();
    }
}

/// Bind the listener and start serving. Returns once the port is bound;
/// the accept loop and frame loop run as background tasks.
pub async fn start(
    config: ServerConfig,
    service: Arc<ConversationService>,
    orchestrator: Arc<AiOrchestrator>,
    directory: Arc<dyn ModelDirectory>,
) -> Result<ServerHandle, ServerError> {
    let registry = Arc::new(ChannelRegistry::new(config.max_send_queue));
    let handlers = Arc::new(HandlerState {
        service,
        orchestrator,
        directory,
        registry: Arc::clone(&registry),
    });

    let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
    let frame_task = tokio::spawn(process_frames(Arc::clone(&handlers), frames_rx));
    let cleanup_task = start_cleanup_task(Arc::clone(&registry), CLEANUP_INTERVAL);

    let app = build_router(AppState { handlers, frames: frames_tx });
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let port = listener.local_addr()?.port();

    let serve_task = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            warn!(%error, "server stopped");
        }
    });

    info!(port, "listening");
    Ok(ServerHandle { port, registry, serve_task, frame_task, cleanup_task })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "channels": state.handlers.registry.count(),
    }))
}

/// The transport trusts the upstream proxy for authentication; identity
/// arrives as query params on the upgrade request.
fn identity_from_query(params: &HashMap<String, String>) -> Result<Identity, String> {
    let id = params
        .get("participantId")
        .filter(|v| !v.trim().is_empty())
        .ok_or("missing participantId")?;
    let role: Role = params
        .get("role")
        .ok_or("missing role")?
        .parse()?;
    Ok(Identity::new(ParticipantId::from_raw(id.as_str()), role))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let identity = match identity_from_query(&params) {
        Ok(identity) => identity,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let registry = Arc::clone(&state.handlers.registry);
        let (channel_id, rx) = registry.register(identity.clone());
        info!(channel_id = %channel_id, participant = %identity.id, role = %identity.role, "channel opened");
        handle_ws_connection(socket, channel_id, rx, registry, state.frames.clone()).await;
    })
}

/// Drain inbound frames and dispatch each in its own task, so one
/// connection's slow request never stalls the others.
async fn process_frames(
    handlers: Arc<HandlerState>,
    mut frames: mpsc::Receiver<(ChannelId, String)>,
) {
    while let Some((channel_id, raw)) = frames.recv().await {
        let handlers = Arc::clone(&handlers);
        tokio::spawn(async move {
            handle_frame(&handlers, &channel_id, raw).await;
        });
    }
}

async fn handle_frame(handlers: &Arc<HandlerState>, channel_id: &ChannelId, raw: String) {
    let request: WireRequest = match serde_json::from_str(&raw) {
        Ok(request) => request,
        Err(_) => {
            respond(handlers, channel_id, WireResponse::parse_error());
            return;
        }
    };

    let Some(identity) = handlers.registry.identity_of(channel_id) else {
        warn!(channel_id = %channel_id, "frame from unregistered channel");
        return;
    };

    let params = request.params.unwrap_or(serde_json::Value::Null);
    let response = dispatch(
        handlers,
        channel_id,
        &identity,
        &request.method,
        &params,
        request.id,
    )
    .await;
    respond(handlers, channel_id, response);
}

fn respond(handlers: &HandlerState, channel_id: &ChannelId, response: WireResponse) {
    match serde_json::to_string(&response) {
        Ok(frame) => {
            handlers.registry.send_raw(channel_id, frame);
        }
        Err(error) => warn!(%error, "failed to serialize response"),
    }
}
