//! HTTP surface.
//!
//! ```text
//! GET  /health                  liveness (no auth)
//! GET  /metrics                 counters and queue depths (no auth)
//! PUT  /api/v1/objects/*key     store an upload, emits ObjectCreated:Put
//! POST /api/v1/events           publish an application event
//! GET  /api/v1/dead-letters     list dead-lettered events
//! GET  /api/v1/records/*key     read an image record
//! ```
//!
//! Every `/api` route requires `Authorization: Bearer <api key>`.

use crate::event::{Event, EventId};
use crate::router::{PublishReport, RouterError};
use crate::store::StoreError;
use crate::topology::Pipeline;
use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Application metrics
pub struct Metrics {
    events_received: AtomicU64,
    uploads_received: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            uploads_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub api_key: String,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, api_key: impl Into<String>) -> Self {
        Self {
            pipeline,
            api_key: api_key.into(),
            metrics: Metrics::new(),
        }
    }
}

/// Response returned when an event is accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventResponse {
    pub id: EventId,
    pub status: String,
    /// Subscriptions the event was routed to
    pub matched: Vec<String>,
    pub delivered: usize,
    pub failures: usize,
    /// One message per failed delivery
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_count() -> usize {
    100
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/objects/*key", put(upload_object))
        .route("/api/v1/events", post(emit_event))
        .route("/api/v1/dead-letters", get(list_dead_letters))
        .route("/api/v1/records/*key", get(get_record))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "));

    match token {
        Some(token) if token == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Get metrics endpoint - returns server metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    // Format uptime as human-readable
    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": uptime_str,
        "received": {
            "events": state.metrics.events_received.load(Ordering::Relaxed),
            "uploads": state.metrics.uploads_received.load(Ordering::Relaxed),
        },
        "pipeline": state.pipeline.stats(),
        "status": "running"
    }))
}

/// `202` when every matching subscription got the event, `503` when a
/// queue refused it, `502` when a direct handler kept failing.
fn publish_status(report: &PublishReport) -> StatusCode {
    if report.is_success() {
        StatusCode::ACCEPTED
    } else if report
        .failures
        .iter()
        .any(|e| matches!(e, RouterError::EnqueueFailed { .. } | RouterError::Aborted(_)))
    {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_GATEWAY
    }
}

fn failure_messages(report: &PublishReport) -> Vec<String> {
    report.failures.iter().map(ToString::to_string).collect()
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
    }
}

async fn upload_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    state.metrics.uploads_received.fetch_add(1, Ordering::Relaxed);

    let (info, report) = state
        .pipeline
        .upload(&key, body.to_vec())
        .await
        .map_err(|e| {
            error!(key = %key, error = %e, "Upload failed");
            store_status(&e)
        })?;

    if !report.is_success() {
        warn!(key = %info.key, failures = report.failure_count(), "Upload rejected, notification not delivered");
        return Ok((
            publish_status(&report),
            Json(json!({
                "key": info.key,
                "eventId": report.event_id,
                "matched": report.matched,
                "errors": failure_messages(&report),
            })),
        ));
    }

    info!(bucket = %info.bucket, key = %info.key, size = info.size, "Object uploaded");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "bucket": info.bucket,
            "key": info.key,
            "size": info.size,
            "eventId": report.event_id,
            "matched": report.matched,
        })),
    ))
}

async fn emit_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<Event>,
) -> (StatusCode, Json<EventResponse>) {
    debug!("Received event: {:?}", event);
    state.metrics.events_received.fetch_add(1, Ordering::Relaxed);

    // Extract or generate correlation ID
    let correlation_id = headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let report = state.pipeline.publish(&event).await;

    info!(
        event_id = %event.id,
        correlation_id = %correlation_id,
        matched = report.matched.len(),
        "Event emitted"
    );

    let status = publish_status(&report);
    (
        status,
        Json(EventResponse {
            id: report.event_id,
            status: if report.is_success() { "accepted" } else { "failed" }.to_string(),
            delivered: report.delivered,
            failures: report.failure_count(),
            errors: failure_messages(&report),
            matched: report.matched,
            correlation_id,
        }),
    )
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> Json<Value> {
    let records = state.pipeline.dead_letters().list(page.count, page.offset);
    Json(json!({
        "count": records.len(),
        "offset": page.offset,
        "records": records,
    }))
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let record = state
        .pipeline
        .stores()
        .records
        .get(&key)
        .await
        .map_err(|e| store_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(Value::Object(record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutterbusConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt; // for `oneshot`

    const KEY: &str = "test-key";

    fn test_app() -> (Router, Arc<Pipeline>) {
        let mut config = ShutterbusConfig::default();
        config.mail.transport = "memory".into();
        let pipeline = Arc::new(Pipeline::in_memory(config).unwrap());
        let state = Arc::new(AppState::new(pipeline.clone(), KEY));
        (app(state), pipeline)
    }

    fn authed(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_api_requires_bearer_key() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/dead-letters")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upload_enqueues_for_ingestion() {
        let (app, pipeline) = test_app();
        let response = app
            .oneshot(authed("PUT", "/api/v1/objects/photos/cat.png", Body::from(vec![1u8, 2, 3])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["key"], "photos/cat.png");
        assert_eq!(body["matched"], json!(["valid-images"]));
        assert_eq!(pipeline.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_emit_event_routes_by_attribute() {
        let (app, _) = test_app();
        let event = json!({
            "kind": "application",
            "attributes": { "message_type": "Unrelated" },
        });
        let response = app
            .oneshot(authed("POST", "/api/v1/events", Body::from(event.to_string())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["matched"], json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_into_full_queue_is_503_and_object_removed() {
        let mut config = ShutterbusConfig::default();
        config.mail.transport = "memory".into();
        config.queue.capacity = Some(1);
        let pipeline = Arc::new(Pipeline::in_memory(config).unwrap());
        let app = app(Arc::new(AppState::new(pipeline.clone(), KEY)));

        let first = app
            .clone()
            .oneshot(authed("PUT", "/api/v1/objects/a.png", Body::from(vec![1u8])))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(authed("PUT", "/api/v1/objects/b.png", Body::from(vec![2u8])))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(second).await;
        assert_eq!(body["errors"].as_array().map(Vec::len), Some(1));

        assert_eq!(pipeline.queue().len(), 1);
        assert!(!pipeline.stores().objects.exists("b.png").await.unwrap());
        assert!(pipeline.stores().objects.exists("a.png").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_event_into_full_queue_is_503() {
        let mut config = ShutterbusConfig::default();
        config.mail.transport = "memory".into();
        config.queue.capacity = Some(0);
        let pipeline = Arc::new(Pipeline::in_memory(config).unwrap());
        let app = app(Arc::new(AppState::new(pipeline, KEY)));

        let event = json!({
            "kind": "upload",
            "attributes": { "eventName": "ObjectCreated:Put" },
            "payloadRef": "c.png",
        });
        let response = app
            .oneshot(authed("POST", "/api/v1/events", Body::from(event.to_string())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["status"], "failed");
        assert_eq!(body["failures"], 1);
    }

    #[tokio::test]
    async fn test_missing_record_is_404() {
        let (app, _) = test_app();
        let response = app
            .oneshot(authed("GET", "/api/v1/records/ghost.png", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_include_pipeline() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["pipeline"]["queue"]["available"], 0);
    }
}
