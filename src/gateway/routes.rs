//! REST + SSE endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use super::{Gateway, StreamEvent};
use crate::bus::NotificationBus;
use crate::dispatcher::Dispatcher;
use crate::error::{GatewayError, QueueError, SubmitError};
use crate::queue::TaskQueue;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub gateway: Arc<Gateway>,
    pub queue: Arc<TaskQueue>,
    pub bus: Arc<NotificationBus>,
}

/// Build the Axum router with submit, status, stream and health routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit", post(submit))
        .route("/status/{task_id}", get(status))
        .route("/stream/{task_id}", get(stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "taskrelay",
        "queue": {
            "pending": state.queue.pending_len(),
            "delayed": state.queue.delayed_len(),
            "inFlight": state.queue.in_flight_len(),
        },
        "subscribers": state.bus.total_subscribers(),
    }))
}

// ── Submit ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    task: String,
    #[serde(default)]
    input: serde_json::Value,
}

async fn submit(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> Response {
    match state.dispatcher.submit(&req.task, req.input).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "taskId": task_id, "status": "queued" })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Status ──────────────────────────────────────────────────────────────

async fn status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response, GatewayError> {
    let task_id = Gateway::parse_id(&raw_id)?;
    let view = state.gateway.status(task_id).await?;
    Ok(Json(view).into_response())
}

// ── Stream ──────────────────────────────────────────────────────────────

async fn stream(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let task_id = Gateway::parse_id(&raw_id)?;
    let events = state.gateway.stream(task_id).await?;
    debug!(task_id = %task_id, "SSE client connected");

    let sse = events.filter_map(|event| async move { to_sse(&event).map(Ok) });
    Ok(Sse::new(sse))
}

fn to_sse(event: &StreamEvent) -> Option<Event> {
    match event.data() {
        Ok(data) => Some(Event::default().event(event.kind().as_str()).data(data)),
        Err(e) => {
            warn!(error = %e, "Failed to encode stream event");
            None
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::UnknownTask(_) => StatusCode::NOT_FOUND,
            GatewayError::MalformedId(_) => StatusCode::BAD_REQUEST,
            GatewayError::Store(e) => {
                error!(error = %e, "Result store unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        error_body(status, self.to_string())
    }
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitError::UnknownTask { .. } => StatusCode::BAD_REQUEST,
            SubmitError::Queue(QueueError::Closed | QueueError::Full { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SubmitError::Store(e) => {
                error!(error = %e, "Result store unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        error_body(status, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::error::StoreError;
    use crate::store::{MemoryResultStore, ResultStore};
    use crate::task::builtin::EchoTask;
    use crate::task::{RetryPolicy, TaskId, TaskRegistry};

    fn app() -> Router {
        let registry = Arc::new(TaskRegistry::new());
        registry.register(Arc::new(EchoTask));
        let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let queue = TaskQueue::new(16);
        let bus = NotificationBus::new(16);
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            queue.clone(),
            store.clone(),
            RetryPolicy::default(),
        ));
        let gateway = Arc::new(Gateway::new(
            store,
            bus.clone(),
            Duration::from_secs(15),
            Duration::from_secs(60),
        ));
        router(AppState {
            dispatcher,
            gateway,
            queue,
            bus,
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_then_status_without_workers() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(
                Request::post("/submit")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"task":"echo","input":{"a":1}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let id = body_json(resp).await["taskId"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(Request::get(format!("/status/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["phase"], "PENDING");
        assert_eq!(body["percent"], 0);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["queue"]["pending"], 1);
    }

    #[tokio::test]
    async fn malformed_stream_id_is_rejected() {
        let resp = app()
            .oneshot(Request::get("/stream/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn gateway_errors_map_to_http_status() {
        let cases = [
            (GatewayError::UnknownTask(TaskId::new()), StatusCode::NOT_FOUND),
            (GatewayError::MalformedId("x".into()), StatusCode::BAD_REQUEST),
            (
                GatewayError::Store(StoreError::Query("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn submit_errors_map_to_http_status() {
        assert_eq!(
            SubmitError::UnknownTask { name: "x".into() }.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SubmitError::Queue(QueueError::Closed).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SubmitError::Queue(QueueError::Full { capacity: 1 }).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
