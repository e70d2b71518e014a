use std::path::PathBuf;

use anyhow::Result;
use config::{Config, File as ConfigFile};
use irrigation_ml::{ArtifactStore, Task};
use irrigation_rpc::orchestrator::{DEFAULT_FIRMWARE_IMAGE, DEFAULT_NAMESPACE};

pub const DEFAULT_CONFIG_PATH: &str = "config/node.toml";
pub const ENV_PREFIX: &str = "IRRIGATION";

/// Service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub config_path: Option<PathBuf>,

    // Network
    pub rpc_host: String,
    pub rpc_port: u16,
    pub allowed_origins: Vec<String>,

    // Storage
    pub db_path: PathBuf,
    pub model_path: PathBuf,

    // Orchestration
    pub control_plane_url: Option<String>,
    pub control_plane_token_path: Option<PathBuf>,
    pub deploy_namespace: String,
    pub firmware_image: String,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

impl AppConfig {
    /// Layer `IRRIGATION_*` environment variables over the optional TOML file.
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            path.exists().then_some(path)
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX));

        let mut app_config = Self::from_config(&builder.build()?)?;
        app_config.config_path = resolved_path;
        Ok(app_config)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let rpc_port = match get_string_value(config, &["RPC_PORT", "rpc_port", "rpc.port"]) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|err| anyhow::anyhow!("invalid RPC_PORT {raw:?}: {err}"))?,
            None => 5000,
        };

        let allowed_origins = get_string_value(
            config,
            &["ALLOWED_ORIGINS", "allowed_origins", "rpc.allowed_origins"],
        )
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect();

        let default_model_path = ArtifactStore::default().model_path(Task::MoistureRegression);

        Ok(Self {
            config_path: None,
            rpc_host: get_string_value(config, &["RPC_HOST", "rpc_host", "rpc.host"])
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            rpc_port,
            allowed_origins,
            db_path: get_string_value(config, &["DB_PATH", "db_path", "storage.db_path"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/sensor_data.db")),
            model_path: get_string_value(config, &["MODEL_PATH", "model_path", "model.path"])
                .map(PathBuf::from)
                .unwrap_or(default_model_path),
            control_plane_url: get_string_value(
                config,
                &["CONTROL_PLANE_URL", "control_plane_url", "deploy.control_plane_url"],
            ),
            control_plane_token_path: get_string_value(
                config,
                &[
                    "CONTROL_PLANE_TOKEN_PATH",
                    "control_plane_token_path",
                    "deploy.token_path",
                ],
            )
            .map(PathBuf::from),
            deploy_namespace: get_string_value(
                config,
                &["DEPLOY_NAMESPACE", "deploy_namespace", "deploy.namespace"],
            )
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            firmware_image: get_string_value(
                config,
                &["FIRMWARE_IMAGE", "firmware_image", "deploy.image"],
            )
            .unwrap_or_else(|| DEFAULT_FIRMWARE_IMAGE.to_string()),
            log_level: get_string_value(config, &["LOG_LEVEL", "log_level", "log.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(config, &["LOG_FORMAT", "log_format", "log.format"])
                .unwrap_or_else(|| "pretty".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_host.trim().is_empty() {
            anyhow::bail!("RPC_HOST must not be empty");
        }
        if self.rpc_port == 0 {
            anyhow::bail!("RPC_PORT must be greater than zero");
        }
        if self.db_path.as_os_str().is_empty() {
            anyhow::bail!("DB_PATH must not be empty");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "compact") {
            anyhow::bail!(
                "LOG_FORMAT must be 'pretty' or 'compact', got {:?}",
                self.log_format
            );
        }
        Ok(())
    }

    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
