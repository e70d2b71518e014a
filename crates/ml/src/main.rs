//! Plant model trainer CLI
//!
//! `plant-train moisture`, `plant-train crop` and `plant-train stats`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use irrigation_ml::dataset::Column;
use irrigation_ml::trainer::{DEFAULT_DATA_PATH, DEFAULT_PREDICTIONS_PATH};
use irrigation_ml::{
    artifact::DEFAULT_MODEL_DIR, Dataset, MaxFeatures, Task, Trainer, TrainingConfig,
    ValidationMetrics,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "plant-train")]
#[command(author = "Smart Irrigation Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Random-forest trainer for soil moisture and crop prediction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the soil moisture regressor
    Moisture(TrainArgs),
    /// Train the crop type classifier
    Crop {
        #[command(flatten)]
        train: TrainArgs,

        /// Write the dataset with a predicted crop column to this path
        #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_PREDICTIONS_PATH)]
        predictions_out: Option<PathBuf>,
    },
    /// Print dataset summaries
    Stats {
        /// Input CSV dataset path
        #[arg(short, long, default_value = DEFAULT_DATA_PATH)]
        data: PathBuf,

        /// Only rows with this crop type
        #[arg(long)]
        crop_type: Option<String>,

        /// Only rows with this soil type
        #[arg(long)]
        soil_type: Option<String>,
    },
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Input CSV dataset path
    #[arg(short, long, default_value = DEFAULT_DATA_PATH)]
    data: PathBuf,

    /// Output directory for the model and metadata
    #[arg(short, long, default_value = DEFAULT_MODEL_DIR)]
    output_dir: PathBuf,

    /// Number of trees in the forest
    #[arg(long, default_value = "100")]
    n_estimators: usize,

    /// Maximum tree depth (unbounded when omitted)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Seed for the split, bootstrap samples and feature order
    #[arg(long, default_value = "42")]
    random_state: u64,

    /// Fraction of rows held out for validation
    #[arg(long, default_value = "0.2")]
    test_size: f64,

    /// Features per split: all, sqrt, log2, an integer or a fraction
    #[arg(long)]
    max_features: Option<MaxFeatures>,

    /// Number of cross-validation folds
    #[arg(long, default_value = "5")]
    cv_folds: usize,
}

impl TrainArgs {
    fn into_config(self, task: Task) -> TrainingConfig {
        let mut config = TrainingConfig::new(task);
        config.data_path = self.data;
        config.output_dir = self.output_dir;
        config.params.n_estimators = self.n_estimators;
        config.params.max_depth = self.max_depth;
        config.params.random_state = self.random_state;
        if let Some(max_features) = self.max_features {
            config.params.max_features = max_features;
        }
        config.test_size = self.test_size;
        config.cv_folds = self.cv_folds;
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Smart Irrigation Plant Trainer v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Moisture(args) => train(args.into_config(Task::MoistureRegression)),
        Command::Crop {
            train: args,
            predictions_out,
        } => {
            let mut config = args.into_config(Task::CropClassification);
            config.predictions_out = predictions_out;
            train(config)
        }
        Command::Stats {
            data,
            crop_type,
            soil_type,
        } => stats(&data, crop_type.as_deref(), soil_type.as_deref()),
    }
}

fn train(config: TrainingConfig) -> Result<()> {
    let task = config.task;
    info!("Training configuration:");
    info!("  Task: {} ({})", task, task.model_type());
    info!("  Trees: {}", config.params.n_estimators);
    info!(
        "  Max depth: {}",
        config
            .params
            .max_depth
            .map_or_else(|| "unbounded".to_string(), |d| d.to_string())
    );
    info!("  Max features: {}", config.params.max_features);
    info!("  Random state: {}", config.params.random_state);
    info!("  Test size: {}", config.test_size);

    let mut trainer = Trainer::new(config);
    let report = match trainer.run() {
        Ok(report) => report,
        Err(err) => {
            let reached = trainer
                .state()
                .map_or_else(|| "start".to_string(), |s| s.to_string());
            error!("Training failed after step '{}': {}", reached, err);
            return Err(err).context("Training run failed");
        }
    };

    match &report.metadata.validation_metrics {
        ValidationMetrics::Regression { mse, r2 } => {
            info!("Validation MSE: {:.4}, R^2: {:.4}", mse, r2);
        }
        ValidationMetrics::Classification { accuracy, .. } => {
            info!("Validation accuracy: {:.4}", accuracy);
        }
    }
    if let Some(class_report) = &report.classification_report {
        info!("Classification Report:");
        for line in class_report.to_string().lines() {
            info!("{}", line);
        }
    }

    info!("Feature importances:");
    let mut importances: Vec<(&String, &f64)> =
        report.metadata.feature_importances.iter().collect();
    importances.sort_by(|a, b| b.1.total_cmp(a.1));
    for (name, value) in importances {
        info!("  {}: {:.4}", name, value);
    }

    info!("✓ Training completed successfully");
    info!("  Model: {}", report.artifact.model_path.display());
    info!("  Metadata: {}", report.artifact.metadata_path.display());
    info!("  Hash: {}", report.artifact.hash);
    if let Some(path) = &report.predictions_path {
        info!("  Predictions: {}", path.display());
    }
    Ok(())
}

fn stats(data: &Path, crop_type: Option<&str>, soil_type: Option<&str>) -> Result<()> {
    let dataset = Dataset::load(data)
        .with_context(|| format!("Failed to load dataset from {}", data.display()))?;
    let filtered = dataset.filter(crop_type, soil_type);

    println!("Rows: {} (of {})", filtered.len(), dataset.len());
    for column in [Column::SoilType, Column::CropType] {
        println!("{}: {}", column.header(), filtered.categories(column).join(", "));
    }
    println!("Average temperature by crop:");
    for (crop, temperature) in filtered.mean_temperature_by_crop() {
        println!("  {:<16} {:.2}", crop, temperature);
    }
    Ok(())
}
