//! REST API server for the retrieval agent
//!
//! Exposes `run_query` over HTTP plus read access to archived runs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::agent::HierarchicalAgent;

/// =============================
/// Request / Response Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryRequest {
    pub query: String,
}

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

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<HierarchicalAgent>,
    /// Cancelled on shutdown; in-flight queries stop and return partial results
    pub shutdown: CancellationToken,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Query Endpoint
/// =============================

async fn run_query(
    State(state): State<ApiState>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let query = req.query.trim();
    if query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("query must not be empty".into())),
        );
    }

    info!("Received query: {}", query);

    match state
        .agent
        .run_query_with_cancellation(query, state.shutdown.child_token())
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "audit_id": outcome.audit_id,
                "status": outcome.response.status,
                "result_text": outcome.response.result_text,
                "evidence": outcome.response.evidence,
                "confidence": outcome.response.confidence,
                "tool_sequence": outcome.response.tool_sequence,
                "warnings": outcome.response.warnings,
            }))),
        ),
        Err(e) => {
            error!("Query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Query failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Audit Endpoint
/// =============================

async fn get_audit_record(
    State(state): State<ApiState>,
    Path(audit_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let Ok(audit_id) = Uuid::parse_str(&audit_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("invalid audit id '{}'", audit_id))),
        );
    };

    let archive = state.agent.archive();
    match archive.get(audit_id).await {
        Ok(Some(record)) => {
            let intact = archive.verify_integrity(audit_id).await.unwrap_or(false);
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "record": record,
                    "integrity_verified": intact,
                }))),
            )
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("no record for {}", audit_id))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(agent: Arc<HierarchicalAgent>, shutdown: CancellationToken) -> Router {
    let state = ApiState { agent, shutdown };

    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(run_query))
        .route("/api/audit/:audit_id", get(get_audit_record))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    agent: Arc<HierarchicalAgent>,
    port: u16,
    shutdown: CancellationToken,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(agent, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
