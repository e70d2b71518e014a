use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use irrigation_ml::artifact::ArtifactStore;
use irrigation_ml::{ForestParams, Observation, PipelineConfig, Task};
use irrigation_rpc::{build_router, AppState, ModelHandle, UnavailableOrchestrator};
use irrigation_storage::MemorySensorStore;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn app_with_model(model_path: &Path) -> Router {
    let state = AppState::new(
        Arc::new(MemorySensorStore::default()),
        Arc::new(UnavailableOrchestrator::new("no control plane configured")),
        Arc::new(ModelHandle::new(model_path)),
    );
    build_router(Arc::new(state))
}

fn app() -> (Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let app = app_with_model(&dir.path().join("plant_model.bin"));
    (app, dir)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn reading(device_id: &str, moisture: f64) -> Value {
    json!({
        "device_id": device_id,
        "temperature": 24.5,
        "humidity": 61.0,
        "soil_moisture": moisture,
        "battery_level": 87.0,
    })
}

#[tokio::test]
async fn test_health() {
    let (app, _dir) = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model_loaded"], false);
    assert_eq!(body["orchestrator"], "simulated");
}

#[tokio::test]
async fn test_reading_without_battery_level_is_rejected() {
    let (app, _dir) = app();
    let mut body = reading("esp-01", 30.0);
    body.as_object_mut().unwrap().remove("battery_level");

    let (status, body) = send(&app, "POST", "/api/sensor-data", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing required fields");
    assert_eq!(body["missing_fields"], json!(["battery_level"]));
    assert_eq!(
        body["required_fields"],
        json!(["device_id", "temperature", "humidity", "soil_moisture", "battery_level"])
    );

    let (status, _) = send(&app, "GET", "/api/sensor-data", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_wrong_field_type_is_rejected() {
    let (app, _dir) = app();
    let mut body = reading("esp-01", 30.0);
    body["temperature"] = json!("warm");
    let (status, body) = send(&app, "POST", "/api/sensor-data", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid sensor reading"));
}

#[tokio::test]
async fn test_store_and_query_readings() {
    let (app, _dir) = app();

    let first = reading("esp-01", 30.0);
    let (status, stored) = send(&app, "POST", "/api/sensor-data", Some(first)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["message"], "Data received and stored successfully");
    send(&app, "POST", "/api/sensor-data", Some(reading("esp-02", 41.0))).await;
    send(&app, "POST", "/api/sensor-data", Some(reading("esp-01", 33.0))).await;

    let (status, latest) = send(&app, "GET", "/api/sensor-data", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["device_id"], "esp-01");
    assert_eq!(latest["soil_moisture"], 33.0);

    let (status, latest) = send(&app, "GET", "/api/sensor-data/esp-02", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["soil_moisture"], 41.0);

    let (status, history) =
        send(&app, "GET", "/api/sensor-data/esp-01/history?hours=1", None).await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["soil_moisture"], 33.0);
    assert_eq!(history[1]["soil_moisture"], 30.0);

    let (status, body) = send(&app, "GET", "/api/sensor-data/esp-09", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No data found for device");

    let (status, body) = send(&app, "GET", "/api/sensor-data/esp-09/history", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No historical data found for device");

    let (status, _) =
        send(&app, "GET", "/api/sensor-data/esp-01/history?hours=-3", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let (app, _dir) = app();
    let register = json!({"device_id": "esp-01", "mac_address": "AA:BB:CC:DD:EE:01"});

    let (status, body) =
        send(&app, "POST", "/api/devices/register", Some(register.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["device"]["device_id"], "esp-01");
    assert_eq!(body["device"]["status"], "online");

    let (status, body) = send(&app, "POST", "/api/devices/register", Some(register)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Device already registered");

    let same_mac = json!({"device_id": "esp-02", "mac_address": "AA:BB:CC:DD:EE:01"});
    let (status, _) = send(&app, "POST", "/api/devices/register", Some(same_mac)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let no_mac = json!({"device_id": "esp-03"});
    let (status, body) = send(&app, "POST", "/api/devices/register", Some(no_mac)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["missing_fields"], json!(["mac_address"]));

    let (status, devices) = send(&app, "GET", "/api/devices", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(devices.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_deploy_without_control_plane_is_simulated() {
    let (app, _dir) = app();

    let (status, body) = send(&app, "POST", "/api/devices/esp-01/deploy", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Device not found");

    let register = json!({"device_id": "esp-01", "mac_address": "AA:BB:CC:DD:EE:01"});
    send(&app, "POST", "/api/devices/register", Some(register)).await;

    let (status, body) = send(&app, "POST", "/api/devices/esp-01/deploy", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["simulated"], true);
    assert_eq!(body["message"], "Development mode: Firmware deployment simulated");
    assert_eq!(body["ota_url"], "http://localhost:8080/firmware/esp-01.bin");
}

#[tokio::test]
async fn test_predict_without_artifact_is_unavailable() {
    let (app, _dir) = app();
    let sample = json!({
        "temperature": 25.0,
        "humidity": 60.0,
        "soil_type": "Loamy",
        "crop_type": "Wheat",
    });

    let (status, body) = send(&app, "POST", "/api/predict/moisture", Some(sample)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().starts_with("no trained model available"));

    let (status, _) = send(&app, "POST", "/api/model/reload", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

fn persist_moisture_model(dir: &Path) -> std::path::PathBuf {
    let rows: Vec<Observation> = (0..40)
        .map(|i| Observation {
            temperature: 20.0 + (i % 10) as f64,
            humidity: 50.0 + (i % 7) as f64,
            moisture: 25.0 + (i % 10) as f64 * 1.5,
            soil_type: if i % 2 == 0 { "Loamy" } else { "Sandy" }.to_string(),
            crop_type: if i % 3 == 0 { "Wheat" } else { "Maize" }.to_string(),
        })
        .collect();
    let params = ForestParams {
        n_estimators: 5,
        ..ForestParams::regressor()
    };
    let pipeline = PipelineConfig::new(Task::MoistureRegression, params, &rows)
        .fit(&rows)
        .unwrap();

    let store = ArtifactStore::new(dir);
    let bytes = irrigation_ml::artifact::encode_pipeline(&pipeline).unwrap();
    std::fs::create_dir_all(store.dir()).unwrap();
    let path = store.model_path(Task::MoistureRegression);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[tokio::test]
async fn test_predict_and_reload_with_artifact() {
    let dir = TempDir::new().unwrap();
    let model_path = persist_moisture_model(dir.path());
    let app = app_with_model(&model_path);

    let sample = json!({
        "Temparature": 25.0,
        "Humidity": 53.0,
        "Soil Type": "Loamy",
        "Crop Type": "Wheat",
    });
    let (status, body) = send(&app, "POST", "/api/predict/moisture", Some(sample)).await;
    assert_eq!(status, StatusCode::OK);
    let moisture = body["moisture"].as_f64().unwrap();
    assert!((25.0..=40.0).contains(&moisture));
    assert_eq!(body["model_type"], "RandomForestRegressor");

    let partial = json!({"temperature": 25.0});
    let (status, body) = send(&app, "POST", "/api/predict/moisture", Some(partial)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(&app, "POST", "/api/model/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["n_trees"], 5);

    let (_, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(health["model_loaded"], true);
}
