use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::services::ServeDir;
use uuid::Uuid;

use tether_core::config::TetherConfig;
use tether_core::store::SessionStore;

use crate::keys::KeySource;
use crate::proxy;

/// Shared application state.
pub struct AppState {
    pub config: TetherConfig,
    pub store: Arc<dyn SessionStore>,
    pub keys: KeySource,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let web_root = state.config.gateway.web_root.clone();
    Router::new()
        .route("/ws/{session_id}", get(session_ws))
        .route("/healthz", get(healthz))
        .with_state(state)
        // Remaining terminal UI assets (scripts, styles) are plain files
        .fallback_service(ServeDir::new(web_root))
}

/// Query parameters for WebSocket upgrade
#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// GET /ws/:id
///
/// Without an Upgrade header this serves the terminal UI bytes (no auth,
/// the page holds no secrets). With one, it runs the authenticated attach
/// flow; everything past the handshake reports failure through close codes.
async fn session_ws(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(session_id) = Uuid::parse_str(&session_id) else {
        return (StatusCode::NOT_FOUND, "Unknown session").into_response();
    };

    if !wants_upgrade(&headers) {
        return serve_terminal_ui(&state).await;
    }

    let Some(token) = query.token else {
        tracing::warn!(%session_id, "upgrade without token");
        return (StatusCode::UNAUTHORIZED, "Missing token").into_response();
    };

    match ws {
        Ok(upgrade) => {
            tracing::info!(%session_id, "terminal WebSocket upgrade");
            upgrade
                .on_upgrade(move |socket| proxy::attach(socket, state, session_id, token))
                .into_response()
        }
        Err(rejection) => rejection.into_response(),
    }
}

async fn serve_terminal_ui(state: &AppState) -> Response {
    let path = std::path::Path::new(&state.config.gateway.web_root).join("index.html");
    match tokio::fs::read(&path).await {
        Ok(bytes) => Html(bytes).into_response(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "terminal UI not readable: {e}");
            (StatusCode::NOT_FOUND, "Terminal UI not found").into_response()
        }
    }
}

/// GET /healthz - 200 when the store is reachable
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}
