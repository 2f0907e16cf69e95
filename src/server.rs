use axum::{
    Router,
    extract::State,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::{delete, get, post},
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::registry::FileSpec;
use crate::routes;
use crate::state::{AppState, ServerEvent, now_iso};

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/status", get(routes::health::status))
        .route("/shutdown", post(routes::health::shutdown_handler))
        // Ingestion surface
        .route("/s3-event", post(routes::ingest::s3_event))
        .route("/jobs/{job_id}", get(routes::ingest::get_job))
        .route("/jobs/{job_id}", delete(routes::ingest::cancel_job))
        // Assets & presign helpers
        .route("/assets/{doc_id}/{filename}", get(routes::assets::serve_asset))
        .route("/upload/presign", post(routes::assets::presign_upload))
        .route("/assets/presign", post(routes::assets::presign_get))
        // Search & research
        .route("/search", post(routes::search::search))
        .route("/api/research/ask", post(routes::research::ask))
        // Document CRUD
        .route("/documents/{doc_id}", get(routes::documents::get_document))
        .route("/documents/{doc_id}", delete(routes::documents::delete_document))
        .route(
            "/documents/{doc_id}/pages/{page}/structure",
            get(routes::documents::get_page_structure),
        )
        .route(
            "/documents/{doc_id}/chunks/{chunk_id}",
            get(routes::documents::get_chunk),
        )
        .route(
            "/documents/{doc_id}/markdown",
            get(routes::documents::get_markdown),
        )
        // WebSocket for real-time progress
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bidirectional WebSocket handler.
/// Server → client: broadcast [`ServerEvent`]s as JSON, per-subscriber order
/// preserved.  Client → server: `ping` and `register_upload_batch` commands.
/// A subscriber that cannot keep up is disconnected rather than allowed to
/// block producers.
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("WebSocket client connected");
    let mut rx = state.event_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    // Direct (request/response) messages for this subscriber only.
    let (direct_tx, mut direct_rx) = tokio::sync::mpsc::channel::<ServerEvent>(32);

    // Server → client: merge broadcast and direct streams, preserving the
    // order each was emitted in.
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(event) => event,
                    None => break,
                },
                broadcast = rx.recv() => match broadcast {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Slow consumer: skip missed events and continue.
                        tracing::warn!("WebSocket client lagged, skipped {} events", n);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };
            let Ok(json) = serde_json::to_string(&event) else { continue };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let registry = state.registry.clone();
    let ws_timeout = Duration::from_secs(state.config.ws_request_timeout_s);

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(cmd) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            let cmd_type = cmd.get("type").and_then(|v| v.as_str()).unwrap_or("");
            tracing::debug!(command = cmd_type, "WebSocket command received");

            match cmd_type {
                "ping" => {
                    let reply = ServerEvent::Pong { timestamp: now_iso() };
                    if direct_tx.try_send(reply).is_err() {
                        // Saturated send buffer: drop the client.
                        break;
                    }
                }
                "register_upload_batch" => {
                    let request_id = cmd
                        .get("request_id")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    let force_upload = cmd
                        .get("force_upload")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    let files: Vec<FileSpec> = cmd
                        .get("files")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();

                    let reply = match tokio::time::timeout(
                        ws_timeout,
                        registry.register_upload_batch(&files, force_upload),
                    )
                    .await
                    {
                        Ok(Ok(registrations)) => ServerEvent::UploadBatchRegistered {
                            request_id,
                            registrations,
                            timestamp: now_iso(),
                        },
                        Ok(Err(e)) => ServerEvent::Error {
                            message: e.to_string(),
                            code: Some("register_upload_batch_failed".to_string()),
                            timestamp: now_iso(),
                        },
                        Err(_) => ServerEvent::Error {
                            message: "register_upload_batch timed out".to_string(),
                            code: Some("timeout".to_string()),
                            timestamp: now_iso(),
                        },
                    };
                    if direct_tx.try_send(reply).is_err() {
                        break;
                    }
                }
                other => {
                    tracing::debug!("Unknown WS command: {}", other);
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other to prevent leaks
    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); },
        _ = &mut recv_task => { send_task.abort(); },
    }
    tracing::info!("WebSocket client disconnected");
}
