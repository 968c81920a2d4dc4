//! Web server module for the historian.
//!
//! Provides the HTTP query API: health, last-value, filtered query, stats.
//! All reads are independent snapshots executed on the blocking pool under a
//! per-call timeout, so a slow store can never stall the server. Non-2xx
//! responses carry `{error_kind, message}`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::config::QueryConfig;
use crate::state::ServiceState;
use crate::storage::{MessageQuery, MessageReader, MessageRecord, StorageError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub reader: MessageReader,
    pub service: Arc<ServiceState>,
    pub query: QueryConfig,
    pub op_timeout: Duration,
}

// =============================================================================
// Error Responses
// =============================================================================

/// API error rendered as `{error_kind, message}` with a non-2xx status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_kind: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error_kind: "not_found",
            message: message.into(),
        }
    }

    fn query_validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_kind: "query_validation",
            message: message.into(),
        }
    }

    fn timeout() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error_kind: "storage_fault",
            message: "store operation timed out".to_string(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_kind: "internal",
            message: message.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_kind: "storage_fault",
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error_kind": self.error_kind,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

// =============================================================================
// Response Shapes
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    bus_connected: bool,
    store_connected: bool,
    messages_stored: i64,
    timestamp: DateTime<Utc>,
}

/// Liveness/readiness probe response.
#[derive(Serialize)]
struct ProbeResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

/// Stats response: table aggregates plus the shared failure counters.
#[derive(Serialize)]
struct StatsResponse {
    total_messages: i64,
    unique_topics: i64,
    oldest_message: Option<DateTime<Utc>>,
    newest_message: Option<DateTime<Utc>>,
    database_size_estimate: i64,
    errors_count: u64,
    dropped_messages: u64,
    malformed_messages: u64,
    storage_faults: u64,
}

/// Query parameters for the filtered query API.
#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub topic: Option<String>,
    pub machine_id: Option<String>,
    pub limit: Option<i64>,
}

// =============================================================================
// Router
// =============================================================================

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/v1/last-value/*topic", get(last_value_handler))
        .route("/api/v1/query", get(query_handler))
        .route("/api/v1/stats", get(stats_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Run a reader operation on the blocking pool under the per-call timeout.
async fn run_read<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&MessageReader) -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    let reader = state.reader.clone();
    let task = tokio::task::spawn_blocking(move || op(&reader));

    match tokio::time::timeout(state.op_timeout, task).await {
        Ok(Ok(result)) => result.map_err(ApiError::from),
        Ok(Err(e)) => Err(ApiError::internal(format!("read task failed: {e}"))),
        Err(_) => Err(ApiError::timeout()),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Service health: bus and store liveness plus the stored-message count.
/// Always 200; degradation is reported in the body, side-effect free.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stored = run_read(&state, |reader| reader.count()).await;
    let store_connected = stored.is_ok();
    let bus_connected = state.service.bus_connected();

    let status = if bus_connected && store_connected {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        bus_connected,
        store_connected,
        messages_stored: stored.unwrap_or(0),
        timestamp: Utc::now(),
    })
}

/// Liveness probe.
async fn healthz_handler() -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness probe that checks store availability.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match run_read(&state, |reader| reader.count()).await {
        Ok(_) => Json(ProbeResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e.message, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ProbeResponse {
                    status: "not_ready".to_string(),
                    db: Some(e.message),
                }),
            )
                .into_response()
        }
    }
}

/// The single most recent record for a topic.
async fn last_value_handler(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Result<Json<MessageRecord>, ApiError> {
    let lookup = topic.clone();
    let record = run_read(&state, move |reader| reader.last_value(&lookup)).await?;

    record
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no records for topic '{topic}'")))
}

/// Filtered query, recency descending, bounded by the validated limit.
async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    let limit = match params.limit {
        None => state.query.default_limit,
        Some(l) if l < 1 || l > i64::from(state.query.max_limit) => {
            return Err(ApiError::query_validation(format!(
                "limit must be between 1 and {}",
                state.query.max_limit
            )));
        }
        Some(l) => l as u32,
    };

    let query = MessageQuery {
        topic: params.topic.filter(|s| !s.is_empty()),
        machine_id: params.machine_id.filter(|s| !s.is_empty()),
        limit,
    };

    let records = run_read(&state, move |reader| reader.query(query)).await?;
    Ok(Json(records))
}

/// Aggregate statistics plus the shared failure counters.
async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = run_read(&state, |reader| reader.stats()).await?;

    Ok(Json(StatsResponse {
        total_messages: stats.total_messages,
        unique_topics: stats.unique_topics,
        oldest_message: stats.oldest_message,
        newest_message: stats.newest_message,
        database_size_estimate: stats.database_size_bytes,
        errors_count: state.service.errors_total(),
        dropped_messages: state.service.dropped_messages(),
        malformed_messages: state.service.malformed_messages(),
        storage_faults: state.service.storage_faults(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MessageDraft, StorageBuilder};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tempfile::tempdir;
    use tower::ServiceExt;

    /// Seed the store, shut the writer down for a deterministic flush, and
    /// build router state over the surviving reader pool.
    fn seeded_state(dir: &tempfile::TempDir, drafts: Vec<MessageDraft>) -> AppState {
        let service = Arc::new(ServiceState::new());
        let handles = StorageBuilder::new(dir.path().join("server.db"))
            .pool_size(2)
            .channel_capacity(100)
            .state(Arc::clone(&service))
            .build()
            .expect("Failed to build storage");

        for draft in drafts {
            handles.writer.insert_message(draft).unwrap();
        }

        let reader = handles.reader.clone();
        handles.shutdown().unwrap();

        AppState {
            reader,
            service,
            query: QueryConfig::default(),
            op_timeout: Duration::from_secs(5),
        }
    }

    fn draft(topic: &str, machine_id: Option<&str>) -> MessageDraft {
        MessageDraft {
            timestamp: Utc::now(),
            topic: topic.to_string(),
            payload: json!({"machine_id": machine_id, "status": "running"}),
            qos: 1,
            machine_id: machine_id.map(str::to_string),
            status: Some("running".to_string()),
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health_reports_degraded_without_bus() {
        let dir = tempdir().unwrap();
        let state = seeded_state(&dir, vec![draft("factory/cnc", Some("CNC-01"))]);
        let app = create_router(state);

        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["bus_connected"], false);
        assert_eq!(body["store_connected"], true);
        assert_eq!(body["messages_stored"], 1);
    }

    #[tokio::test]
    async fn test_health_ok_when_bus_connected() {
        let dir = tempdir().unwrap();
        let state = seeded_state(&dir, vec![]);
        state.service.set_bus_connected(true);
        let app = create_router(state);

        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_last_value_found_and_not_found() {
        let dir = tempdir().unwrap();
        let state = seeded_state(&dir, vec![draft("factory/cnc", Some("CNC-01"))]);
        let app = create_router(state);

        let (status, body) = get_json(app.clone(), "/api/v1/last-value/factory/cnc").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["topic"], "factory/cnc");
        assert_eq!(body["payload"]["machine_id"], "CNC-01");

        let (status, body) = get_json(app, "/api/v1/last-value/no/such/topic").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_kind"], "not_found");
        assert!(body["message"].as_str().unwrap().contains("no/such/topic"));
    }

    #[tokio::test]
    async fn test_query_rejects_invalid_limit() {
        let dir = tempdir().unwrap();
        let state = seeded_state(&dir, vec![]);
        let max = state.query.max_limit;
        let app = create_router(state);

        let (status, body) = get_json(app.clone(), "/api/v1/query?limit=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_kind"], "query_validation");

        let (status, _) = get_json(app.clone(), "/api/v1/query?limit=-5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let over = i64::from(max) + 1;
        let (status, _) = get_json(app, &format!("/api/v1/query?limit={over}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_query_filters_and_limit() {
        let dir = tempdir().unwrap();
        let state = seeded_state(
            &dir,
            vec![
                draft("factory/cnc", Some("CNC-01")),
                draft("factory/press", Some("PRESS-02")),
                draft("factory/cnc", Some("CNC-01")),
            ],
        );
        let app = create_router(state);

        let (status, body) = get_json(app.clone(), "/api/v1/query?machine_id=CNC-01&limit=1").await;
        assert_eq!(status, StatusCode::OK);
        let records = body.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["machine_id"], "CNC-01");

        let (status, body) = get_json(app, "/api/v1/query?topic=factory/press").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let dir = tempdir().unwrap();
        let state = seeded_state(
            &dir,
            vec![
                draft("factory/cnc", Some("CNC-01")),
                draft("factory/press", None),
            ],
        );
        state.service.record_dropped();
        let app = create_router(state);

        let (status, body) = get_json(app, "/api/v1/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_messages"], 2);
        assert_eq!(body["unique_topics"], 2);
        assert_eq!(body["errors_count"], 1);
        assert_eq!(body["dropped_messages"], 1);
        assert!(body["oldest_message"].is_string());
        assert!(body["database_size_estimate"].is_i64() || body["database_size_estimate"].is_u64());
    }

    #[tokio::test]
    async fn test_probes() {
        let dir = tempdir().unwrap();
        let state = seeded_state(&dir, vec![]);
        let app = create_router(state);

        let (status, body) = get_json(app.clone(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get_json(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["db"], "ready");
    }
}
