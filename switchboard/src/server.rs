use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use switchboard_sfu::{RoomId, RoomRegistry, RoomStats};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub default_room: String,
    pub max_message_size: usize,
}

/// Error response JSON structure
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

fn not_found(message: String) -> Response {
    let status = StatusCode::NOT_FOUND;
    (
        status,
        Json(ErrorResponse {
            error: message,
            status: status.as_u16(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct RoomList {
    rooms: Vec<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::websocket_handler))
        .route("/healthz", get(health_check))
        .route("/rooms", get(list_rooms))
        .route("/rooms/{room_id}", get(room_stats))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    "ok"
}

async fn list_rooms(State(state): State<AppState>) -> Json<RoomList> {
    let mut rooms: Vec<String> = state
        .registry
        .room_ids()
        .iter()
        .map(ToString::to_string)
        .collect();
    rooms.sort();
    Json(RoomList { rooms })
}

async fn room_stats(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomStats>, Response> {
    state
        .registry
        .room_stats(&RoomId::from(room_id.as_str()))
        .map(Json)
        .ok_or_else(|| not_found(format!("Room not found: {room_id}")))
}

/// Serve HTTP until a shutdown signal arrives
pub async fn serve(config: &Config, registry: Arc<RoomRegistry>) -> anyhow::Result<()> {
    let state = AppState {
        registry: Arc::clone(&registry),
        default_room: config.server.default_room.clone(),
        max_message_size: config.server.max_message_size,
    };
    let router = create_router(state);

    let address = config.http_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("HTTP server listening on {}", address);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing peer sessions...");
            registry.shutdown();
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
