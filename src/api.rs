// ============================================================================
// HTTP API
// ============================================================================
// Action-dispatch endpoint for dashboards:
//   POST /{action}   body: {"data": {...}}
//   POST /           body: {"action": "...", "data": {...}}
//   GET  /health
// Success is `200 {"data": <report>}`; failures are
// `{"error": {"code", "message"}}` with a status matching the code.
// Each request's latency is queued as a `server.request_time` sample keyed
// by the parsed action name, or "unknown" for anything else.
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::aggregation::{AggregationEngine, AggregationRequest};
use crate::collector::MetricCollector;
use crate::config::ReportOptions;
use crate::error::{PulseError, PulseResult};
use crate::report::{Report, ReportAction, ReportGenerator};
use crate::types::MetricSample;
use crate::{
    metric_types, DEFAULT_REQUEST_TIMEOUT_SECS, ENGINE_NAME, ENGINE_VERSION, MAX_REQUEST_BODY_BYTES,
};

// ----------------------------------------------------------------------------
// Server State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiState {
    pub engine: Arc<AggregationEngine>,
    pub generator: Arc<ReportGenerator>,
    /// Records the latency and status of every report request
    pub collector: Option<Arc<MetricCollector>>,
    /// Deadline for one dispatch, answered with the error envelope
    pub request_timeout: Duration,
}

impl ApiState {
    pub fn new(engine: AggregationEngine, generator: ReportGenerator) -> Self {
        Self {
            engine: Arc::new(engine),
            generator: Arc::new(generator),
            collector: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_collector(mut self, collector: Arc<MetricCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    fn observe(&self, action: &str, started: Instant, status: StatusCode) {
        let Some(collector) = &self.collector else {
            return;
        };
        let key = action
            .parse::<ReportAction>()
            .map(|action| action.as_str())
            .unwrap_or("unknown");
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        collector.record_sample(
            MetricSample::new(metric_types::SERVER_REQUEST_TIME, elapsed_ms)
                .with_label("action", key)
                .with_label("status", status.as_u16().to_string()),
        );
    }
}

// ----------------------------------------------------------------------------
// Router Creation
// ----------------------------------------------------------------------------

pub fn create_router(mut state: ApiState, request_timeout: Duration) -> Router {
    state.request_timeout = request_timeout;
    Router::new()
        .route("/health", get(health))
        .route("/", post(dispatch_body_action))
        .route("/:action", post(dispatch_path_action))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(CorsLayer::permissive())
}

// ----------------------------------------------------------------------------
// Wire Types
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ActionBody {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub data: Report,
}

/// Error half of the API contract.
#[derive(Debug)]
pub struct ApiError(pub PulseError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            PulseError::Forbidden { .. } => StatusCode::FORBIDDEN,
            PulseError::UnknownAction { .. } | PulseError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            PulseError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PulseError> for ApiError {
    fn from(e: PulseError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(target: "pulse::api", category = self.0.category(), error = %self.0, "Request failed");
        } else {
            debug!(target: "pulse::api", code = self.0.code(), error = %self.0, "Request rejected");
        }

        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

async fn health() -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "name": ENGINE_NAME,
        "version": ENGINE_VERSION,
    }))
}

async fn dispatch_path_action(
    State(state): State<ApiState>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse>, ApiError> {
    let started = Instant::now();
    let result = match parse_body(&body) {
        Ok(body) => {
            dispatch_within_deadline(&state, &action, body.data, bearer_token(&headers)).await
        }
        Err(e) => Err(e),
    };
    respond(&state, &action, started, result)
}

async fn dispatch_body_action(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse>, ApiError> {
    let started = Instant::now();
    let body = parse_body(&body)?;
    let action = body.action.ok_or_else(|| PulseError::BadRequest {
        message: "missing 'action' field".into(),
    })?;
    let result = dispatch_within_deadline(&state, &action, body.data, bearer_token(&headers)).await;
    respond(&state, &action, started, result)
}

fn respond(
    state: &ApiState,
    action: &str,
    started: Instant,
    result: PulseResult<Report>,
) -> Result<Json<ApiResponse>, ApiError> {
    let result = result.map_err(ApiError);
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status_code(),
    };
    state.observe(action, started, status);
    result.map(|report| Json(ApiResponse { data: report }))
}

async fn dispatch_within_deadline(
    state: &ApiState,
    action: &str,
    data: Option<JsonValue>,
    credentials: Option<String>,
) -> PulseResult<Report> {
    tokio::time::timeout(state.request_timeout, dispatch(state, action, data, credentials))
        .await
        .unwrap_or_else(|_| {
            Err(PulseError::Timeout {
                timeout_ms: state.request_timeout.as_millis() as u64,
            })
        })
}

async fn dispatch(
    state: &ApiState,
    action: &str,
    data: Option<JsonValue>,
    credentials: Option<String>,
) -> PulseResult<Report> {
    let action: ReportAction = action.parse()?;
    let options = data
        .as_ref()
        .map(ReportOptions::from_json)
        .unwrap_or_default();

    info!(
        target: "pulse::api",
        %action,
        time_range = options.time_range.as_str(),
        "Report requested"
    );

    let request = AggregationRequest {
        action,
        options,
        credentials,
    };
    let aggregation = state.engine.aggregate(&request).await?;
    Ok(state.generator.build(&aggregation))
}

fn parse_body(body: &Bytes) -> Result<ActionBody, PulseError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ActionBody::default());
    }

    let parsed: ActionBody = serde_json::from_slice(body).map_err(|e| PulseError::BadRequest {
        message: format!("invalid JSON body: {e}"),
    })?;

    if let Some(data) = &parsed.data {
        if !data.is_object() && !data.is_null() {
            return Err(PulseError::BadRequest {
                message: "'data' must be an object".into(),
            });
        }
    }
    Ok(parsed)
}

/// Token from `Authorization: Bearer <token>`
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_string())
    } else {
        None
    }
}
