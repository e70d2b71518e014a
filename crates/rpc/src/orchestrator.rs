//! Firmware deployment through a container control plane.
//!
//! The service never talks to devices directly. Deploying firmware means
//! asking the control plane to run an OTA server for the device. Without a
//! reachable control plane the deployment is simulated and the caller gets
//! a local OTA URL instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub const DEFAULT_NAMESPACE: &str = "farm-iot";
pub const DEFAULT_FIRMWARE_IMAGE: &str = "farm-iot-registry/esp-firmware:latest";
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

const PEM_CERTIFICATE_MARKER: &str = "-----BEGIN CERTIFICATE-----";

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("control plane request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("control plane rejected deployment ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("failed to read control plane token {}: {source}", path.display())]
    Token {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read control plane CA {}: {source}", path.display())]
    CaCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("control plane CA {} holds no PEM certificate", path.display())]
    InvalidCaCertificate { path: PathBuf },
}

/// Result of a deployment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    Deployed {
        deployment_name: String,
        ota_url: String,
    },
    /// No control plane; the OTA URL points at a local development server.
    Unavailable { ota_url: String, reason: String },
}

impl DeployOutcome {
    pub fn ota_url(&self) -> &str {
        match self {
            DeployOutcome::Deployed { ota_url, .. }
            | DeployOutcome::Unavailable { ota_url, .. } => ota_url,
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, DeployOutcome::Unavailable { .. })
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn deploy_firmware(&self, device_id: &str) -> Result<DeployOutcome, OrchestratorError>;

    /// Short label used in logs and `/health`.
    fn name(&self) -> &'static str;
}

pub fn deployment_name(device_id: &str) -> String {
    format!("esp8266-{device_id}")
}

pub fn simulated_ota_url(device_id: &str) -> String {
    format!("http://localhost:8080/firmware/{device_id}.bin")
}

pub fn deployed_ota_url(device_id: &str, namespace: &str) -> String {
    format!("http://ota-server-{device_id}.{namespace}.local/firmware.bin")
}

/// `apps/v1` Deployment running the OTA server for one device.
pub fn deployment_manifest(device_id: &str, namespace: &str, image: &str) -> Value {
    let labels = json!({
        "app": "esp-device",
        "device-id": device_id,
    });
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": deployment_name(device_id),
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": "ota-server",
                        "image": image,
                        "ports": [{ "containerPort": 80 }],
                        "env": [{ "name": "DEVICE_ID", "value": device_id }],
                    }],
                },
            },
        },
    })
}

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub api_url: String,
    pub token_path: Option<PathBuf>,
    /// Extra root certificate (PEM) trusted for the API server.
    pub ca_path: Option<PathBuf>,
    pub namespace: String,
    pub image: String,
}

impl ControlPlaneConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token_path: None,
            ca_path: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: DEFAULT_FIRMWARE_IMAGE.to_string(),
        }
    }

    /// Control plane reachable from inside a cluster pod, if any.
    pub fn in_cluster() -> Option<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let token = Path::new(SERVICE_ACCOUNT_TOKEN_PATH);
        if !token.exists() {
            debug!("KUBERNETES_SERVICE_HOST set but no service account token found");
            return None;
        }
        let mut config = Self::new(format!("https://{host}:{port}"));
        config.token_path = Some(token.to_path_buf());
        let ca = Path::new(SERVICE_ACCOUNT_CA_PATH);
        if ca.exists() {
            config.ca_path = Some(ca.to_path_buf());
        } else {
            warn!("No service account CA at {}; using default roots", ca.display());
        }
        Some(config)
    }

    fn deployments_url(&self) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments",
            self.api_url.trim_end_matches('/'),
            self.namespace
        )
    }
}

/// Creates Deployments through the control plane REST API.
pub struct ControlPlaneOrchestrator {
    client: reqwest::Client,
    config: ControlPlaneConfig,
    token: Option<String>,
}

impl ControlPlaneOrchestrator {
    pub fn new(config: ControlPlaneConfig) -> Result<Self, OrchestratorError> {
        let token = match &config.token_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|source| OrchestratorError::Token {
                        path: path.clone(),
                        source,
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if let Some(path) = &config.ca_path {
            builder = builder.add_root_certificate(load_ca_certificate(path)?);
        }
        let client = builder.build()?;
        info!("Using control plane at {}", config.api_url);
        Ok(Self {
            client,
            config,
            token,
        })
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }
}

#[async_trait]
impl Orchestrator for ControlPlaneOrchestrator {
    async fn deploy_firmware(&self, device_id: &str) -> Result<DeployOutcome, OrchestratorError> {
        let manifest = deployment_manifest(device_id, &self.config.namespace, &self.config.image);
        let mut request = self
            .client
            .post(self.config.deployments_url())
            .json(&manifest);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Deployment for {} rejected with {}", device_id, status);
            return Err(OrchestratorError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let name = deployment_name(device_id);
        info!("Created deployment {} in {}", name, self.config.namespace);
        Ok(DeployOutcome::Deployed {
            deployment_name: name,
            ota_url: deployed_ota_url(device_id, &self.config.namespace),
        })
    }

    fn name(&self) -> &'static str {
        "control-plane"
    }
}

fn load_ca_certificate(path: &Path) -> Result<reqwest::Certificate, OrchestratorError> {
    let pem = std::fs::read(path).map_err(|source| OrchestratorError::CaCertificate {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = || OrchestratorError::InvalidCaCertificate {
        path: path.to_path_buf(),
    };
    if !String::from_utf8_lossy(&pem).contains(PEM_CERTIFICATE_MARKER) {
        return Err(invalid());
    }
    reqwest::Certificate::from_pem(&pem).map_err(|_| invalid())
}

/// Stand-in used when no control plane is configured.
#[derive(Debug, Clone)]
pub struct UnavailableOrchestrator {
    reason: String,
}

impl UnavailableOrchestrator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Orchestrator for UnavailableOrchestrator {
    async fn deploy_firmware(&self, device_id: &str) -> Result<DeployOutcome, OrchestratorError> {
        debug!("Simulating firmware deployment for {}", device_id);
        Ok(DeployOutcome::Unavailable {
            ota_url: simulated_ota_url(device_id),
            reason: self.reason.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
