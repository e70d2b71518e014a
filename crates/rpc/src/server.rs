use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use irrigation_ml::{ArtifactError, PipelineError, Sample};
use irrigation_storage::{Device, NewReading, SensorReading, SensorStore, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::model_handle::ModelHandle;
use crate::orchestrator::{DeployOutcome, Orchestrator};

const READING_FIELDS: &[&str] = &[
    "device_id",
    "temperature",
    "humidity",
    "soil_moisture",
    "battery_level",
];
const REGISTRATION_FIELDS: &[&str] = &["device_id", "mac_address"];
const DEFAULT_HISTORY_HOURS: i64 = 24;
const MAX_HISTORY_HOURS: i64 = 24 * 366 * 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SensorStore>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub model: Arc<ModelHandle>,
    pub allowed_origins: Vec<String>,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SensorStore>,
        orchestrator: Arc<dyn Orchestrator>,
        model: Arc<ModelHandle>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            model,
            allowed_origins: Vec::new(),
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(flatten)]
    details: Map<String, Value>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Map<String, Value>,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
            details: Map::new(),
        }
    }

    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let payload = Json(ErrorResponse {
            error: self.message,
            details: self.details,
        });
        (self.status, payload).into_response()
    }
}

pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    let shared = Arc::new(state);
    let app = build_router(shared.clone());
    let listener = bind_listener(addr).await?;
    info!("Ingestion API listening on {}", addr);
    axum::serve(listener, app)
        .await
        .context("RPC server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/api/sensor-data",
            post(handle_store_reading).get(handle_latest_reading),
        )
        .route("/api/sensor-data/:device_id", get(handle_device_reading))
        .route(
            "/api/sensor-data/:device_id/history",
            get(handle_device_history),
        )
        .route("/api/devices", get(handle_list_devices))
        .route("/api/devices/register", post(handle_register_device))
        .route("/api/devices/:device_id/deploy", post(handle_deploy_firmware))
        .route("/api/predict/moisture", post(handle_predict_moisture))
        .route("/api/model/reload", post(handle_reload_model))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Any origin unless a list is configured; `*` in the list also means any.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    model_loaded: bool,
    orchestrator: &'static str,
    req_total: u64,
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        model_loaded: state.model.is_loaded(),
        orchestrator: state.orchestrator.name(),
        req_total,
    })
}

/// Parse a JSON object body and check that every required field is set.
fn parse_object(body: &Bytes, required: &[&str]) -> Result<Value, ApiError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| ApiError::bad_request("request body must be a JSON object"))?;

    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| object.get(*field).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::bad_request("Missing required fields")
            .with_detail("missing_fields", json!(missing))
            .with_detail("required_fields", json!(required)));
    }
    Ok(value)
}

#[derive(Debug, Serialize)]
struct StoredResponse {
    message: &'static str,
    id: u64,
    timestamp: String,
}

async fn handle_store_reading(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<StoredResponse>, ApiError> {
    state.record_request();
    let value = parse_object(&body, READING_FIELDS)?;
    let reading: NewReading = serde_json::from_value(value)
        .map_err(|err| ApiError::bad_request(format!("invalid sensor reading: {err}")))?;

    let stored = state
        .store
        .append_reading(reading)
        .map_err(|err| ApiError::internal(format!("failed to store reading: {err}")))?;
    info!("Stored reading {} from {}", stored.id, stored.device_id);

    Ok(Json(StoredResponse {
        message: "Data received and stored successfully",
        id: stored.id,
        timestamp: stored.timestamp.to_rfc3339(),
    }))
}

async fn handle_latest_reading(
    State(state): State<SharedState>,
) -> Result<Json<SensorReading>, ApiError> {
    state.record_request();
    state
        .store
        .latest_reading(None)
        .map_err(|err| ApiError::internal(format!("failed to fetch latest reading: {err}")))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No data found"))
}

async fn handle_device_reading(
    State(state): State<SharedState>,
    AxumPath(device_id): AxumPath<String>,
) -> Result<Json<SensorReading>, ApiError> {
    state.record_request();
    state
        .store
        .latest_reading(Some(&device_id))
        .map_err(|err| ApiError::internal(format!("failed to fetch reading: {err}")))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No data found for device"))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    hours: Option<String>,
}

async fn handle_device_history(
    State(state): State<SharedState>,
    AxumPath(device_id): AxumPath<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SensorReading>>, ApiError> {
    state.record_request();
    let hours = parse_hours(query.hours.as_deref())?;
    let since = Utc::now() - Duration::hours(hours);

    let history = state
        .store
        .reading_history(&device_id, since)
        .map_err(|err| ApiError::internal(format!("failed to fetch history: {err}")))?;
    if history.is_empty() {
        return Err(ApiError::not_found("No historical data found for device"));
    }
    Ok(Json(history))
}

fn parse_hours(raw: Option<&str>) -> Result<i64, ApiError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_HISTORY_HOURS);
    };
    match raw.trim().parse::<i64>() {
        Ok(hours) if hours > 0 => Ok(hours.min(MAX_HISTORY_HOURS)),
        _ => Err(ApiError::bad_request(format!(
            "invalid hours: expected a positive integer, got {raw:?}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationRequest {
    device_id: String,
    mac_address: String,
}

#[derive(Debug, Serialize)]
struct RegisteredResponse {
    message: &'static str,
    device: Device,
}

async fn handle_register_device(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<(StatusCode, Json<RegisteredResponse>), ApiError> {
    state.record_request();
    let value = parse_object(&body, REGISTRATION_FIELDS)?;
    let request: RegistrationRequest = serde_json::from_value(value)
        .map_err(|err| ApiError::bad_request(format!("invalid registration: {err}")))?;

    let device = state
        .store
        .register_device(&request.device_id, &request.mac_address)
        .map_err(|err| match err {
            StorageError::DuplicateDevice(_) => {
                ApiError::new(StatusCode::CONFLICT, "Device already registered")
            }
            other => ApiError::internal(format!("failed to register device: {other}")),
        })?;
    info!("Registered device {} ({})", device.device_id, device.mac_address);

    Ok((
        StatusCode::CREATED,
        Json(RegisteredResponse {
            message: "Device registered successfully",
            device,
        }),
    ))
}

async fn handle_list_devices(
    State(state): State<SharedState>,
) -> Result<Json<Vec<Device>>, ApiError> {
    state.record_request();
    state
        .store
        .list_devices()
        .map(Json)
        .map_err(|err| ApiError::internal(format!("failed to list devices: {err}")))
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    message: &'static str,
    device_id: String,
    ota_url: String,
    simulated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn handle_deploy_firmware(
    State(state): State<SharedState>,
    AxumPath(device_id): AxumPath<String>,
) -> Result<Json<DeployResponse>, ApiError> {
    state.record_request();
    state
        .store
        .get_device(&device_id)
        .map_err(|err| ApiError::internal(format!("failed to fetch device: {err}")))?
        .ok_or_else(|| ApiError::not_found("Device not found"))?;

    let outcome = state
        .orchestrator
        .deploy_firmware(&device_id)
        .await
        .map_err(|err| ApiError::internal(format!("failed to deploy firmware: {err}")))?;

    let response = match outcome {
        DeployOutcome::Deployed {
            deployment_name,
            ota_url,
        } => DeployResponse {
            message: "Firmware deployment initiated",
            device_id,
            ota_url,
            simulated: false,
            deployment: Some(deployment_name),
            reason: None,
        },
        DeployOutcome::Unavailable { ota_url, reason } => DeployResponse {
            message: "Development mode: Firmware deployment simulated",
            device_id,
            ota_url,
            simulated: true,
            deployment: None,
            reason: Some(reason),
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct PredictionResponse {
    moisture: f64,
    model_type: &'static str,
}

async fn handle_predict_moisture(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<PredictionResponse>, ApiError> {
    state.record_request();
    let sample: Sample = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid prediction input: {err}")))?;

    let pipeline = state.model.get().await.map_err(model_error)?;
    let moisture = pipeline.predict_moisture(&sample).map_err(|err| match err {
        PipelineError::MissingFeature(_) | PipelineError::Shape { .. } => {
            ApiError::bad_request(err.to_string())
        }
        other => ApiError::internal(format!("prediction failed: {other}")),
    })?;

    Ok(Json(PredictionResponse {
        moisture,
        model_type: pipeline.task().model_type(),
    }))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    message: &'static str,
    path: String,
    n_trees: usize,
    encoded_features: Vec<String>,
}

async fn handle_reload_model(
    State(state): State<SharedState>,
) -> Result<Json<ReloadResponse>, ApiError> {
    state.record_request();
    let pipeline = state.model.reload().await.map_err(model_error)?;
    Ok(Json(ReloadResponse {
        message: "Model reloaded",
        path: state.model.path().display().to_string(),
        n_trees: pipeline.forest().n_trees(),
        encoded_features: pipeline.encoded_feature_names(),
    }))
}

fn model_error(err: ArtifactError) -> ApiError {
    match err {
        ArtifactError::NotFound(path) => ApiError::service_unavailable(format!(
            "no trained model available at {}",
            path.display()
        )),
        other => ApiError::internal(format!("failed to load model: {other}")),
    }
}
