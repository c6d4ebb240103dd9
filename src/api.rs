//! REST API Server for the Operations Copilot
//!
//! Exposes queries, the approval desk and the audit trail over HTTP.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::OrchestrationError;
use crate::models::{Query, QueryOptions, Style};
use crate::runtime::Copilot;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub session_id: Option<String>,
    pub requester: Option<String>,
    pub top_k: Option<usize>,
    pub style: Option<Style>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionRequest {
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn failure(e: OrchestrationError) -> Reply {
    let status = match &e {
        OrchestrationError::ActionNotFound(_) => StatusCode::NOT_FOUND,
        OrchestrationError::InvalidTransition { .. }
        | OrchestrationError::ActionSuperseded(_)
        | OrchestrationError::Cancelled(_) => StatusCode::CONFLICT,
        OrchestrationError::DispatchFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    (status, Json(ApiResponse::error(e.user_message())))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub copilot: Arc<Copilot>,
}

/// =============================
/// Helpers
/// =============================

/// Map an arbitrary client-supplied id onto a UUID, stable across calls.
fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: Option<&str>) -> Option<Uuid> {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Some(Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v)))
        }
        _ => None,
    }
}

fn build_query(req: QueryRequest) -> Query {
    let mut query = Query::new(req.text).with_options(QueryOptions {
        top_k: req.top_k,
        style: req.style,
        temperature: req.temperature,
    });
    if let Some(session_id) = parse_or_stable_uuid(req.session_id.as_deref()) {
        query = query.with_session(session_id);
    }
    if let Some(requester) = req.requester.filter(|r| !r.trim().is_empty()) {
        query = query.with_requester(requester);
    }
    query
}

fn actor_of(req: &DecisionRequest) -> String {
    req.actor
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or("operator")
        .to_string()
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "generator": state.copilot.generator_name(),
        "audit_backend": state.copilot.audit().backend(),
        "indexed_chunks": state.copilot.indexed_chunks(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Query Endpoint
/// =============================

async fn run_query(State(state): State<ApiState>, Json(req): Json<QueryRequest>) -> Reply {
    if req.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Query text is empty".into())),
        );
    }

    let query = build_query(req);
    info!(query_id = %query.query_id, session_id = %query.session_id, "Received query");

    match state.copilot.ask(query).await {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::success(result))),
        Err(e) => failure(e),
    }
}

/// =============================
/// Approval Endpoints
/// =============================

async fn pending_actions(State(state): State<ApiState>) -> Reply {
    let pending = state.copilot.desk().pending().await;
    (StatusCode::OK, Json(ApiResponse::success(pending)))
}

async fn approve_action(
    State(state): State<ApiState>,
    Path(request_id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> Reply {
    let actor = actor_of(&req);
    match state.copilot.desk().approve_and_dispatch(request_id, &actor).await {
        Ok(request) => (StatusCode::OK, Json(ApiResponse::success(request))),
        Err(e) => failure(e),
    }
}

async fn reject_action(
    State(state): State<ApiState>,
    Path(request_id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> Reply {
    let actor = actor_of(&req);
    match state
        .copilot
        .desk()
        .reject(request_id, &actor, req.reason)
        .await
    {
        Ok(request) => (StatusCode::OK, Json(ApiResponse::success(request))),
        Err(e) => failure(e),
    }
}

/// =============================
/// Audit Endpoints
/// =============================

async fn audit_for_query(State(state): State<ApiState>, Path(query_id): Path<Uuid>) -> Reply {
    match state.copilot.audit().for_query(query_id).await {
        Ok(records) => (StatusCode::OK, Json(ApiResponse::success(records))),
        Err(e) => failure(e),
    }
}

async fn audit_for_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Reply {
    let Some(session_id) = parse_or_stable_uuid(Some(&session_id)) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Missing session id".into())),
        );
    };
    match state.copilot.audit().for_session(session_id).await {
        Ok(records) => (StatusCode::OK, Json(ApiResponse::success(records))),
        Err(e) => failure(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(copilot: Arc<Copilot>) -> Router {
    let state = ApiState { copilot };

    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(run_query))
        .route("/api/actions/pending", get(pending_actions))
        .route("/api/actions/:id/approve", post(approve_action))
        .route("/api/actions/:id/reject", post(reject_action))
        .route("/api/audit/query/:id", get(audit_for_query))
        .route("/api/audit/session/:id", get(audit_for_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    copilot: Arc<Copilot>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(copilot);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionApi, ActionDesk, DispatchReceipt};
    use crate::audit::{AuditStore, InMemoryAuditStore};
    use crate::config::CopilotConfig;
    use crate::generation::ExtractiveGenerator;
    use crate::models::{ActionRequest, Chunk, ChunkMetadata};
    use crate::retrieval::{HashingEmbedder, InMemoryIndex};
    use crate::session::SessionRegistry;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct AcceptingApi;

    #[async_trait]
    impl ActionApi for AcceptingApi {
        async fn dispatch(&self, _request: &ActionRequest) -> crate::Result<DispatchReceipt> {
            Ok(DispatchReceipt {
                status: 200,
                message: "ok".into(),
                body: serde_json::json!({}),
            })
        }
    }

    async fn copilot() -> Arc<Copilot> {
        let embedder = Arc::new(HashingEmbedder::default());
        let chunk = Chunk {
            chunk_id: "guide_p1_c0".into(),
            document_id: "guide".into(),
            text: "Refunds are issued within five business days of approval.".into(),
            metadata: ChunkMetadata::default(),
        };
        let index = InMemoryIndex::from_chunks(vec![chunk], embedder.as_ref())
            .await
            .unwrap();
        let audit: Arc<dyn AuditStore> = Arc::new(InMemoryAuditStore::new());
        let sessions = SessionRegistry::new();
        let desk = Arc::new(ActionDesk::new(
            Arc::new(AcceptingApi),
            Arc::clone(&audit),
            sessions.clone(),
        ));
        Arc::new(
            Copilot::assemble(
                CopilotConfig::default(),
                Arc::new(index),
                embedder,
                Arc::new(ExtractiveGenerator::new()),
                desk,
                audit,
                sessions,
                1,
            )
            .unwrap(),
        )
    }

    async fn call(router: Router, method: &str, uri: &str, body: serde_json::Value) -> (StatusCode, ApiResponse) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_stable_uuid_is_deterministic() {
        let a = stable_uuid_from_string("chat-42");
        assert_eq!(a, stable_uuid_from_string("chat-42"));
        assert_ne!(a, stable_uuid_from_string("chat-43"));
        assert_eq!(a.get_version_num(), 4);

        let real = Uuid::new_v4();
        assert_eq!(parse_or_stable_uuid(Some(&real.to_string())), Some(real));
        assert_eq!(parse_or_stable_uuid(Some("  ")), None);
    }

    #[tokio::test]
    async fn test_action_query_then_approve() {
        let copilot = copilot().await;
        let router = create_router(Arc::clone(&copilot));

        let (status, body) = call(
            router.clone(),
            "POST",
            "/api/query",
            serde_json::json!({"text": "pause 'daily backup process'", "session_id": "desk-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let data = body.data.unwrap();
        assert_eq!(data["intent"], "action");
        let request_id = data["outcome"]["request"]["request_id"]
            .as_str()
            .unwrap()
            .to_string();

        let (status, body) = call(
            router.clone(),
            "POST",
            &format!("/api/actions/{}/approve", request_id),
            serde_json::json!({"actor": "lead"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap()["state"], "dispatched");

        let (status, body) = call(
            router,
            "POST",
            &format!("/api/actions/{}/reject", request_id),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let router = create_router(copilot().await);
        let (status, body) = call(router, "POST", "/api/query", serde_json::json!({"text": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_found() {
        let router = create_router(copilot().await);
        let (status, _) = call(
            router,
            "POST",
            &format!("/api/actions/{}/approve", Uuid::new_v4()),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
