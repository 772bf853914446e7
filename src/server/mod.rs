//! Downstream server
//!
//! JSON-RPC over WebSocket for subscribers, plus a small HTTP read surface.
//! Default port: 7120

mod session;

pub use session::Session;

use crate::state::{object_spec_from_query, StateHubHandle};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared state for handlers
pub struct ServerState {
    pub hub: StateHubHandle,
    /// Closes open sockets and stops the listener
    pub cancel: CancellationToken,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, Json(self)).into_response()
    }
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/websocket", get(websocket_upgrade))
        .route("/printer/objects/query", get(objects_query))
        .route("/api/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /websocket - JSON-RPC subscriber connection
async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn handle_websocket(mut socket: WebSocket, state: Arc<ServerState>) {
    let (session, mut frames) = Session::open(state.hub.clone());
    debug!(connection_id = session.connection_id(), "WebSocket client connected");

    loop {
        tokio::select! {
            // Outbound: replies and notifications
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                match frame.to_text() {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            debug!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode frame: {}", e),
                }
            }
            // Inbound: requests
            result = socket.recv() => {
                let text = match result {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                };
                if let Err(e) = session.handle_text(&text).await {
                    warn!("Closing WebSocket: {}", e);
                    break;
                }
            }
            _ = state.cancel.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    session.close();
}

/// GET /printer/objects/query?a.b&c=x,y - one-shot read
async fn objects_query(
    RawQuery(raw): RawQuery,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Value>, ApiError> {
    let objects = object_spec_from_query(raw.as_deref().unwrap_or_default());
    let values = state.hub.query(objects).await.map_err(|e| ApiError {
        error: e.to_string(),
    })?;
    Ok(Json(json!({ "result": { "status": values } })))
}

/// GET /api/health - Health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// Bind and serve until the cancellation token fires
pub async fn start_server(state: Arc<ServerState>, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind server on {}", addr))?;
    info!("🌐 Subscriber server listening on ws://{}/websocket", addr);

    serve(listener, state).await
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    let cancel = state.cancel.clone();
    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Server error")?;

    info!("Subscriber server stopped");
    Ok(())
}
