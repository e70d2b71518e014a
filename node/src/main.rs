use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use irrigation_rpc::{
    start_server, AppState, ControlPlaneConfig, ControlPlaneOrchestrator, ModelHandle,
    Orchestrator, UnavailableOrchestrator,
};
use irrigation_storage::{SensorStore, SledSensorStore};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;
mod version;

use settings::AppConfig;
use version::version_line;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("irrigation-node")
        .version(version::SERVICE_VERSION)
        .about("Smart irrigation sensor ingestion service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (defaults to config/node.toml when present)"),
        )
        .arg(
            Arg::new("db-path")
                .long("db-path")
                .value_name("DIR")
                .help("Sensor database directory"),
        )
        .arg(
            Arg::new("model-path")
                .long("model-path")
                .value_name("FILE")
                .help("Moisture model artifact served by /api/predict/moisture"),
        )
        .arg(
            Arg::new("rpc-host")
                .long("rpc-host")
                .value_name("HOST")
                .help("Override HTTP bind host"),
        )
        .arg(
            Arg::new("rpc-port")
                .long("rpc-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override HTTP port"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "compact"])
                .help("Select log output format"),
        )
        .arg(
            Arg::new("dev")
                .long("dev")
                .action(ArgAction::SetTrue)
                .help("Run in development mode (debug logging)"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate the configuration, then exit"),
        )
        .get_matches();

    let mut config = AppConfig::load(matches.get_one::<String>("config").map(String::as_str))?;
    apply_overrides(&matches, &mut config);
    config.validate()?;

    if matches.get_flag("check") {
        println!("{}", version_line());
        println!("configuration OK: {:#?}", config);
        return Ok(());
    }

    init_logging(&config)?;
    info!("Starting {}", version_line());
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }

    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = Arc::new(SledSensorStore::open(&config.db_path).with_context(|| {
        format!("failed to open sensor store at {}", config.db_path.display())
    })?);
    info!("Sensor store opened at {}", config.db_path.display());

    let model = Arc::new(ModelHandle::new(&config.model_path));
    if config.model_path.exists() {
        if let Err(err) = model.get().await {
            warn!("Failed to preload model {}: {}", config.model_path.display(), err);
        }
    } else {
        warn!(
            "No model artifact at {}; predictions are unavailable until one is trained",
            config.model_path.display()
        );
    }

    let mut state = AppState::new(store.clone(), orchestrator_from_config(&config), model);
    state.allowed_origins = config.allowed_origins.clone();

    let addr = config.rpc_addr();
    let server = tokio::spawn(async move { start_server(state, &addr).await });

    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("HTTP server failed: {:#}", err);
                    return Err(err);
                }
                Err(err) => return Err(err).context("HTTP server task panicked"),
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    store.flush().context("failed to flush sensor store")?;
    info!("Irrigation node shutdown complete");
    Ok(())
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(db_path) = matches.get_one::<String>("db-path") {
        config.db_path = db_path.into();
    }

    if let Some(model_path) = matches.get_one::<String>("model-path") {
        config.model_path = model_path.into();
    }

    if let Some(rpc_host) = matches.get_one::<String>("rpc-host") {
        config.rpc_host = rpc_host.clone();
    }

    if let Some(rpc_port) = matches.get_one::<u16>("rpc-port") {
        config.rpc_port = *rpc_port;
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if matches.get_flag("dev") {
        config.log_level = "debug".to_string();
        config.log_format = "pretty".to_string();
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "compact" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

/// Explicit control plane first, then in-cluster detection, else simulated.
fn orchestrator_from_config(config: &AppConfig) -> Arc<dyn Orchestrator> {
    let control_plane = match &config.control_plane_url {
        Some(url) => {
            let mut control_plane = ControlPlaneConfig::new(url.clone());
            control_plane.token_path = config.control_plane_token_path.clone();
            Some(control_plane)
        }
        None => ControlPlaneConfig::in_cluster(),
    };

    let Some(mut control_plane) = control_plane else {
        warn!("Running without a control plane - firmware deployments will be simulated");
        return Arc::new(UnavailableOrchestrator::new("no control plane configured"));
    };
    control_plane.namespace = config.deploy_namespace.clone();
    control_plane.image = config.firmware_image.clone();

    match ControlPlaneOrchestrator::new(control_plane) {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(err) => {
            warn!("Control plane client unavailable, deployments will be simulated: {}", err);
            Arc::new(UnavailableOrchestrator::new(format!(
                "control plane client unavailable: {err}"
            )))
        }
    }
}
