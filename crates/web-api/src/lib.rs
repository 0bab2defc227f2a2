//! WebSocket 传输层
//!
//! 把中继引擎暴露为 Axum 服务：`/ws` 升级为帧协议连接，`/health`
//! 提供存活探针。认证在帧协议内完成（AUTH 帧），不走 HTTP 头。

pub mod auth;
pub mod state;
pub mod ws_connection;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use auth::JwtAuthenticator;
pub use state::AppState;
pub use ws_connection::RelayConnection;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| RelayConnection::new(socket, state).run())
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    active_sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        active_sessions: state.engine.registry().live_count(),
    })
}
