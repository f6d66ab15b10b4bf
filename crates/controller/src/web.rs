use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use tether_core::config::TetherConfig;
use tether_core::error::{ApiError, StoreError};
use tether_core::limit::{Decision, RateLimiter};
use tether_core::secret::constant_time_eq;
use tether_core::store::{SessionRow, SessionStore, TokenRow};
use tether_core::token::Signer;

use crate::admission::{self, CreateSessionRequest};
use crate::orchestrator::{WorkerLauncher, WorkerSpec, resolve_with_deadline};

/// Shared application state.
pub struct AppState {
    pub config: TetherConfig,
    pub api_key: String,
    pub store: Arc<dyn SessionStore>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub signer: Signer,
    pub limiter: RateLimiter,
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(state)
}

/// Caller identity at the trust boundary: the ingress forwards the client
/// address in x-forwarded-for.
fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Check the admission API key from the Authorization header.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if constant_time_eq(key.as_bytes(), state.api_key.as_bytes()) => Ok(()),
        _ => {
            tracing::warn!("rejected request with missing or invalid API key");
            Err(ApiError::Unauthorized)
        }
    }
}

/// Render an error for the caller: a status code and a minimal body.
/// Orchestrator and store detail stays in the logs.
fn error_response(e: ApiError) -> Response {
    let status = match &e {
        ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
        ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ApiError::NotFound => StatusCode::NOT_FOUND,
        ApiError::Replayed => StatusCode::CONFLICT,
        ApiError::OrchestratorFailure(_) | ApiError::StoreFailure(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ApiError::Transient => StatusCode::SERVICE_UNAVAILABLE,
    };
    let message = match &e {
        ApiError::OrchestratorFailure(_) => "failed to provision worker".to_string(),
        ApiError::StoreFailure(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    (status, Json(json!({ "error": message }))).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: Uuid,
    ws_url: String,
    token: String,
    terminal_url: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    session_id: Uuid,
    status: &'static str,
    ws_url: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// POST /api/sessions
///
/// Admit a job request: mint a single-use capability token, materialise the
/// worker, and record the session durably.
async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return error_response(e);
    }

    let identity = caller_identity(&headers);
    if let Decision::Limited { retry_after } = state.limiter.admit(&identity) {
        let retry_secs = retry_after.as_secs().max(1);
        tracing::warn!(%identity, retry_secs, "session create rate limited");
        tracing::warn!(target: "audit", event = "rate_limited", %identity, "Rate limit exceeded");
        let mut response = error_response(ApiError::RateLimited);
        if let Ok(value) = retry_secs.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }

    let job = match admission::validate(&req) {
        Ok(job) => job,
        Err(reason) => {
            tracing::info!(%identity, %reason, "session create rejected");
            return error_response(ApiError::BadRequest(reason));
        }
    };

    let session_id = Uuid::new_v4();
    let worker_name = format!("tether-worker-{session_id}");
    let now = Utc::now();
    let session_ttl = state.config.session.session_ttl_secs;
    let expires_at = now + chrono::Duration::seconds(session_ttl as i64);

    let spec = WorkerSpec {
        worker_name: worker_name.clone(),
        session_id,
        job,
        active_deadline_secs: session_ttl,
    };

    // Submission is not retried: the caller may re-POST for a fresh session.
    if let Err(e) = state.launcher.submit(&spec).await {
        tracing::error!(%session_id, error = %e, "worker submission failed");
        return error_response(ApiError::OrchestratorFailure(e.to_string()));
    }

    // Session row first (endpoint unset), then the token record, and only
    // then is the token handed to the caller.
    let row = SessionRow {
        session_id,
        owner_id: identity.clone(),
        worker_name: worker_name.clone(),
        worker_endpoint: None,
        created_at: now,
        expires_at,
    };
    if let Err(e) = state.store.put_session(&row).await {
        tracing::error!(%session_id, error = %e, "failed to record session");
        state.launcher.best_effort_delete(&worker_name).await;
        return error_response(ApiError::StoreFailure(e.to_string()));
    }

    let token_ttl = Duration::from_secs(state.config.token_ttl_secs());
    let issued = match state.signer.issue(session_id, &identity, token_ttl) {
        Ok(issued) => issued,
        Err(e) => {
            tracing::error!(%session_id, error = %e, "token mint failed");
            state.launcher.best_effort_delete(&worker_name).await;
            return error_response(ApiError::StoreFailure(e.to_string()));
        }
    };
    let token_row = TokenRow {
        token_id: issued.token_id,
        session_id,
        expires_at: issued.expires_at,
    };
    if let Err(e) = state.store.put_token(&token_row).await {
        tracing::error!(%session_id, error = %e, "failed to record token");
        state.launcher.best_effort_delete(&worker_name).await;
        return error_response(ApiError::StoreFailure(e.to_string()));
    }

    // Resolve the worker endpoint within the synchronous budget; a timeout
    // is still a success, the gateway re-resolves on attach.
    let resolved = resolve_with_deadline(
        state.launcher.as_ref(),
        &worker_name,
        Duration::from_secs(state.config.orchestrator.resolve_timeout_secs),
        Duration::from_millis(state.config.orchestrator.resolve_interval_ms),
    )
    .await;

    let status = match resolved {
        Some(endpoint) => match state.store.update_session_endpoint(session_id, &endpoint).await {
            Ok(()) | Err(StoreError::Conflict) => "ready",
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "failed to record endpoint, leaving pending");
                spawn_endpoint_resolver(Arc::clone(&state), session_id, worker_name.clone(), expires_at);
                "pending"
            }
        },
        None => {
            tracing::warn!(%session_id, "endpoint unresolved within budget, continuing in background");
            spawn_endpoint_resolver(Arc::clone(&state), session_id, worker_name.clone(), expires_at);
            "pending"
        }
    };

    tracing::info!(%session_id, %worker_name, %status, "session created");
    tracing::info!(target: "audit", event = "session_created", %session_id, owner = %identity, "Session created");

    let ws_url = format!("/ws/{session_id}");
    let terminal_url = format!(
        "{}/ws/{session_id}?token={}",
        state.config.controller.public_gateway_url.trim_end_matches('/'),
        issued.token
    );

    (
        StatusCode::OK,
        Json(CreateSessionResponse {
            session_id,
            ws_url,
            token: issued.token,
            terminal_url,
            status,
        }),
    )
        .into_response()
}

/// Keep polling for the worker endpoint after the synchronous budget is
/// spent, until the session expires.
fn spawn_endpoint_resolver(
    state: Arc<AppState>,
    session_id: Uuid,
    worker_name: String,
    expires_at: DateTime<Utc>,
) {
    tokio::spawn(async move {
        let interval = Duration::from_millis(state.config.orchestrator.resolve_interval_ms);
        loop {
            if Utc::now() >= expires_at {
                tracing::warn!(%session_id, "worker endpoint never resolved before session expiry");
                return;
            }
            match state.launcher.resolve_endpoint(&worker_name).await {
                Ok(Some(endpoint)) => {
                    match state.store.update_session_endpoint(session_id, &endpoint).await {
                        Ok(()) => {
                            tracing::info!(%session_id, %endpoint, "worker endpoint resolved late");
                        }
                        // Another resolver won; the endpoint is set either way
                        Err(StoreError::Conflict) => {}
                        Err(e) => {
                            tracing::warn!(%session_id, error = %e, "failed to record late endpoint");
                        }
                    }
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(%session_id, error = %e, "late endpoint probe failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
    });
}

/// GET /api/sessions/:id - session summary (requires API key)
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return error_response(e);
    }

    // Unparsable ids are indistinguishable from unknown ones
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(ApiError::NotFound);
    };

    match state.store.get_session(id).await {
        Ok(row) => (
            StatusCode::OK,
            Json(SessionSummary {
                session_id: row.session_id,
                status: row.status(),
                ws_url: format!("/ws/{}", row.session_id),
                created_at: row.created_at,
                expires_at: row.expires_at,
            }),
        )
            .into_response(),
        Err(e) => {
            if !matches!(e, StoreError::Absent) {
                tracing::error!(session_id = %id, error = %e, "session lookup failed");
            }
            error_response(e.into())
        }
    }
}

/// GET /.well-known/jwks.json - published verification keys (public)
async fn jwks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(state.signer.jwks()),
    )
}

/// GET /healthz - liveness: the store answers within its op timeout
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

/// GET /readyz - readiness: liveness plus a loaded signing key
async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    if state.signer.jwks().keys.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "no signing key" })),
        )
            .into_response();
    }
    healthz(State(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::OnceLock;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use tether_core::store::MemStore;
    use tether_core::token::{JwksDocument, Verifier};

    use crate::orchestrator::test_support::FakeLauncher;

    const TEST_API_KEY: &str = "test-api-key-for-router-tests";

    // Key generation is slow; share one signer across the module.
    static TEST_SIGNER: OnceLock<Signer> = OnceLock::new();

    fn test_signer() -> Signer {
        TEST_SIGNER
            .get_or_init(|| Signer::generate().unwrap().0)
            .clone()
    }

    fn test_state_with(
        launcher: Arc<dyn WorkerLauncher>,
        store: Arc<dyn SessionStore>,
    ) -> Arc<AppState> {
        let mut config = TetherConfig::default();
        config.controller.api_key = Some(TEST_API_KEY.to_string());
        config.controller.public_gateway_url = "https://term.example.com".to_string();
        // Single synchronous probe, fast background polling
        config.orchestrator.resolve_timeout_secs = 0;
        config.orchestrator.resolve_interval_ms = 10;

        Arc::new(AppState {
            config,
            api_key: TEST_API_KEY.to_string(),
            store,
            launcher,
            signer: test_signer(),
            limiter: RateLimiter::new(5, Duration::from_secs(60)),
        })
    }

    fn test_state(launcher: Arc<dyn WorkerLauncher>) -> Arc<AppState> {
        test_state_with(launcher, Arc::new(MemStore::new()))
    }

    fn create_request(body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/sessions")
            .header("authorization", format!("Bearer {TEST_API_KEY}"))
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn valid_body() -> serde_json::Value {
        json!({
            "code_url": "https://github.com/x/y/tree/main/p",
            "command": "node index.js"
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    #[tokio::test]
    async fn create_session_happy_path() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(Arc::clone(&state));

        let response = app.oneshot(create_request(&valid_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let session_id = json["sessionId"].as_str().unwrap();
        assert_eq!(session_id.len(), 36);
        assert_eq!(json["wsUrl"], format!("/ws/{session_id}"));
        assert_eq!(json["status"], "ready");

        let token = json["token"].as_str().unwrap();
        assert_eq!(token.split('.').count(), 3);

        let terminal_url = json["terminalUrl"].as_str().unwrap();
        assert!(terminal_url.contains(session_id));
        assert!(terminal_url.contains(token));
        assert!(terminal_url.starts_with("https://term.example.com/ws/"));

        // The durable rows exist: session is routable, token is consumable
        let sid = Uuid::parse_str(session_id).unwrap();
        let row = state.store.get_session(sid).await.unwrap();
        assert_eq!(row.worker_endpoint.as_deref(), Some("10.0.0.5:7681"));
    }

    #[tokio::test]
    async fn issued_token_verifies_against_published_jwks() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(create_request(&valid_body()))
            .await
            .unwrap();
        let created = body_json(response).await;
        let token = created["token"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/.well-known/jwks.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("cache-control")
                .and_then(|v| v.to_str().ok()),
            Some("public, max-age=300")
        );

        let doc: JwksDocument = serde_json::from_value(body_json(response).await).unwrap();
        let verifier = Verifier::from_jwks(&doc).unwrap();
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.aud, "ws");
        assert_eq!(claims.sid, created["sessionId"].as_str().unwrap());
    }

    #[tokio::test]
    async fn create_session_requires_api_key() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/sessions")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&valid_body()).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_session_rejects_wrong_api_key() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/sessions")
            .header("authorization", "Bearer not-the-key")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&valid_body()).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_session_rejects_invalid_body() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        for body in [
            json!({ "command": "node index.js" }),
            json!({ "code_url": "https://example.com/not-a-source", "command": "node index.js" }),
            json!({ "code_url": "https://github.com/x/y/tree/main/`p`", "command": "node index.js" }),
            json!({ "code_url": "https://github.com/x/y/tree/main/p", "command": "a".repeat(501) }),
        ] {
            let response = app.clone().oneshot(create_request(&body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            let json = body_json(response).await;
            assert!(json["error"].is_string());
        }
    }

    #[tokio::test]
    async fn command_at_500_bytes_is_admitted() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        let body = json!({
            "code_url": "https://github.com/x/y/tree/main/p",
            "command": "a".repeat(500)
        });
        let response = app.oneshot(create_request(&body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sixth_create_within_window_is_rate_limited() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        for i in 0..5 {
            let response = app.clone().oneshot(create_request(&valid_body())).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request {i}");
        }
        let response = app.clone().oneshot(create_request(&valid_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .expect("429 carries a retry-after header");
        assert!(retry_after >= 1);

        // A different caller is unaffected
        let mut request = create_request(&valid_body());
        request
            .headers_mut()
            .insert("x-forwarded-for", "198.51.100.4".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unresolved_endpoint_reports_pending_then_fills_in() {
        let launcher = Arc::new(FakeLauncher::after(3, "10.0.0.8:7681"));
        let state = test_state(Arc::clone(&launcher) as Arc<dyn WorkerLauncher>);
        let app = build_router(Arc::clone(&state));

        let response = app.oneshot(create_request(&valid_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "pending");

        // The background resolver completes the row
        let sid = Uuid::parse_str(json["sessionId"].as_str().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let row = state.store.get_session(sid).await.unwrap();
        assert_eq!(row.worker_endpoint.as_deref(), Some("10.0.0.8:7681"));
    }

    #[tokio::test]
    async fn submission_failure_is_500_without_session_row() {
        let launcher = Arc::new(FakeLauncher::failing());
        let state = test_state(Arc::clone(&launcher) as Arc<dyn WorkerLauncher>);
        let app = build_router(state);

        let response = app.oneshot(create_request(&valid_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(launcher.submissions.lock().unwrap().is_empty());
    }

    /// Store that refuses session writes, for undo-path coverage.
    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn put_session(&self, _row: &SessionRow) -> Result<(), StoreError> {
            Err(StoreError::Pool("store down".to_string()))
        }
        async fn update_session_endpoint(
            &self,
            _session_id: Uuid,
            _endpoint: &str,
        ) -> Result<(), StoreError> {
            Err(StoreError::Pool("store down".to_string()))
        }
        async fn get_session(&self, _session_id: Uuid) -> Result<SessionRow, StoreError> {
            Err(StoreError::Absent)
        }
        async fn put_token(&self, _row: &TokenRow) -> Result<(), StoreError> {
            Err(StoreError::Pool("store down".to_string()))
        }
        async fn consume_token(&self, _token_id: Uuid) -> Result<Uuid, StoreError> {
            Err(StoreError::Absent)
        }
        async fn prune_expired(
            &self,
            _before: DateTime<Utc>,
        ) -> Result<(u64, u64), StoreError> {
            Ok((0, 0))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Pool("store down".to_string()))
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn store_failure_after_submission_undoes_the_worker() {
        let launcher = Arc::new(FakeLauncher::ready("10.0.0.5:7681"));
        let state = test_state_with(
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            Arc::new(FailingStore),
        );
        let app = build_router(state);

        let response = app.oneshot(create_request(&valid_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let submitted = launcher.submissions.lock().unwrap()[0].worker_name.clone();
        assert_eq!(*launcher.deleted.lock().unwrap(), vec![submitted]);
    }

    #[tokio::test]
    async fn get_unknown_session_is_404() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        for id in [Uuid::new_v4().to_string(), "does-not-exist".to_string()] {
            let request = Request::builder()
                .uri(format!("/api/sessions/{id}"))
                .header("authorization", format!("Bearer {TEST_API_KEY}"))
                .body(Body::empty())
                .unwrap();

            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{id}");
        }
    }

    #[tokio::test]
    async fn get_session_returns_summary() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        let response = app.clone().oneshot(create_request(&valid_body())).await.unwrap();
        let created = body_json(response).await;
        let session_id = created["sessionId"].as_str().unwrap();

        let request = Request::builder()
            .uri(format!("/api/sessions/{session_id}"))
            .header("authorization", format!("Bearer {TEST_API_KEY}"))
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["sessionId"], session_id);
        assert_eq!(json["status"], "ready");
        assert_eq!(json["wsUrl"], format!("/ws/{session_id}"));
        // The summary never includes the token or the worker address
        assert!(json.get("token").is_none());
        assert!(json.get("workerEndpoint").is_none());
    }

    #[tokio::test]
    async fn health_and_readiness() {
        let state = test_state(Arc::new(FakeLauncher::ready("10.0.0.5:7681")));
        let app = build_router(state);

        for path in ["/healthz", "/readyz"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            let json = body_json(response).await;
            assert_eq!(json["status"], "ok");
        }
    }

    #[tokio::test]
    async fn healthz_reports_store_outage() {
        let state = test_state_with(
            Arc::new(FakeLauncher::ready("10.0.0.5:7681")),
            Arc::new(FailingStore),
        );
        let app = build_router(state);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn caller_identity_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(caller_identity(&headers), "203.0.113.9");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.7".parse().unwrap());
        assert_eq!(caller_identity(&headers), "198.51.100.7");

        assert_eq!(caller_identity(&HeaderMap::new()), "unknown");
    }
}
