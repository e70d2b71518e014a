//! Training runs
//!
//! A run moves through `loaded -> validated -> split -> fit -> evaluated ->
//! persisted`. Any failing step aborts the run before anything is written.

use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::artifact::{
    ArtifactStore, Hyperparameters, ModelMetadata, PersistedArtifact, ValidationMetrics,
    DEFAULT_MODEL_DIR,
};
use crate::dataset::{Dataset, ObservationTable};
use crate::errors::{PipelineError, TrainerError};
use crate::features::Task;
use crate::forest::ForestParams;
use crate::metrics::{mean_squared_error, r2_score, ClassificationReport};
use crate::pipeline::{PipelineConfig, TrainedPipeline};
use crate::validation::{mean, train_test_split};

pub const DEFAULT_DATA_PATH: &str = "data/raw/plant_data/data_core.csv";
pub const DEFAULT_PREDICTIONS_PATH: &str = "data/processed/predicted_data_core.csv";
pub const PREDICTION_COLUMN: &str = "Predicted Crop Type";

/// Configuration for a single training run.
#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub task: Task,
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
    pub params: ForestParams,
    pub test_size: f64,
    pub cv_folds: usize,
    /// Crop task only: where to write per-row predictions.
    pub predictions_out: Option<PathBuf>,
}

impl TrainingConfig {
    pub fn new(task: Task) -> Self {
        let params = if task.is_classification() {
            ForestParams::classifier()
        } else {
            ForestParams::regressor()
        };
        Self {
            task,
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            output_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            params,
            test_size: 0.2,
            cv_folds: 5,
            predictions_out: None,
        }
    }
}

/// Step a run has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Loaded,
    Validated,
    Split,
    Fit,
    Evaluated,
    Persisted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Loaded => "loaded",
            RunState::Validated => "validated",
            RunState::Split => "split",
            RunState::Fit => "fit",
            RunState::Evaluated => "evaluated",
            RunState::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub state: RunState,
    pub metadata: ModelMetadata,
    pub artifact: PersistedArtifact,
    pub classification_report: Option<ClassificationReport>,
    pub predictions_path: Option<PathBuf>,
}

/// Drives one training run.
pub struct Trainer {
    config: TrainingConfig,
    state: Option<RunState>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    /// Last step reached, if any.
    pub fn state(&self) -> Option<RunState> {
        self.state
    }

    fn advance(&mut self, state: RunState) {
        self.state = Some(state);
        info!("[{}] {}", self.config.task, state);
    }

    pub fn run(&mut self) -> Result<TrainingReport, TrainerError> {
        let task = self.config.task;

        info!("Loading dataset from: {}", self.config.data_path.display());
        let table = ObservationTable::from_csv(&self.config.data_path)?;
        self.advance(RunState::Loaded);

        let dataset = table.validate()?;
        info!("Validated {} of {} rows", dataset.len(), table.len());
        self.advance(RunState::Validated);

        let (train_idx, test_idx) = train_test_split(
            dataset.len(),
            self.config.test_size,
            self.config.params.random_state,
        )?;
        let train_rows = dataset.select(&train_idx);
        let test_rows = dataset.select(&test_idx);
        info!(
            "Split into {} training and {} test rows",
            train_rows.len(),
            test_rows.len()
        );
        self.advance(RunState::Split);

        let pipeline_config =
            PipelineConfig::new(task, self.config.params.clone(), dataset.observations());
        info!(
            "Fitting {} with {} trees",
            task.model_type(),
            self.config.params.n_estimators
        );
        let pipeline = pipeline_config.fit(&train_rows)?;
        self.advance(RunState::Fit);

        let (validation_metrics, classification_report) =
            evaluate(&pipeline_config, &pipeline, &test_rows)?;
        let cv_scores =
            pipeline_config.cross_validate(dataset.observations(), self.config.cv_folds)?;
        let cv_mean = mean(&cv_scores);
        info!("Cross-validation scores: {:?}", cv_scores);
        info!("Mean CV score: {:.4}", cv_mean);
        self.advance(RunState::Evaluated);

        let metadata = self.build_metadata(
            &pipeline,
            validation_metrics,
            cv_scores,
            cv_mean,
            (dataset.len(), train_rows.len(), test_rows.len()),
        );
        let store = ArtifactStore::new(&self.config.output_dir);
        let artifact = store.persist(&pipeline, metadata.clone())?;
        self.advance(RunState::Persisted);

        let predictions_path = match (&self.config.predictions_out, task) {
            (Some(path), Task::CropClassification) => {
                write_predictions(&pipeline, &dataset, path)?;
                Some(path.clone())
            }
            (Some(_), Task::MoistureRegression) => {
                warn!("Prediction export is only available for the crop task");
                None
            }
            (None, _) => None,
        };

        Ok(TrainingReport {
            state: RunState::Persisted,
            metadata: ModelMetadata {
                artifact_hash: artifact.hash.clone(),
                ..metadata
            },
            artifact,
            classification_report,
            predictions_path,
        })
    }

    fn build_metadata(
        &self,
        pipeline: &TrainedPipeline,
        validation_metrics: ValidationMetrics,
        cross_validation_scores: Vec<f64>,
        cross_validation_mean: f64,
        (n_samples, n_train_samples, n_test_samples): (usize, usize, usize),
    ) -> ModelMetadata {
        let task = self.config.task;
        let params = &self.config.params;
        let encoded_features = pipeline.encoded_feature_names();
        let feature_importances: BTreeMap<String, f64> = encoded_features
            .iter()
            .cloned()
            .zip(pipeline.forest().feature_importances().iter().copied())
            .collect();

        ModelMetadata {
            features: task.features().iter().map(|c| c.header().to_string()).collect(),
            encoded_features,
            target: task.target().header().to_string(),
            model_type: task.model_type().to_string(),
            hyperparameters: Hyperparameters {
                n_estimators: params.n_estimators,
                max_depth: params.max_depth,
                min_samples_split: params.min_samples_split,
                min_samples_leaf: params.min_samples_leaf,
                max_features: params.max_features.to_string(),
                bootstrap: params.bootstrap,
                random_state: params.random_state,
                test_size: self.config.test_size,
                cv_folds: self.config.cv_folds,
            },
            validation_metrics,
            cross_validation_scores,
            cross_validation_mean,
            feature_importances,
            n_samples,
            n_train_samples,
            n_test_samples,
            artifact_hash: String::new(),
            trained_at: Utc::now(),
            trainer_version: crate::VERSION.to_string(),
        }
    }
}

fn evaluate(
    config: &PipelineConfig,
    pipeline: &TrainedPipeline,
    test_rows: &[crate::dataset::Observation],
) -> Result<(ValidationMetrics, Option<ClassificationReport>), PipelineError> {
    let predicted = pipeline.predict_raw(test_rows)?;
    let actual = config.targets(test_rows)?;

    match config.label_encoder() {
        None => {
            let mse = mean_squared_error(&actual, &predicted);
            let r2 = r2_score(&actual, &predicted);
            info!("Mean Squared Error: {:.4}", mse);
            info!("R^2 Score: {:.4}", r2);
            Ok((ValidationMetrics::Regression { mse, r2 }, None))
        }
        Some(labels) => {
            let y_true: Vec<usize> = actual.iter().map(|&v| v as usize).collect();
            let y_pred: Vec<usize> = predicted.iter().map(|&v| v as usize).collect();
            let report = ClassificationReport::new(&y_true, &y_pred, labels.classes());
            info!("Accuracy: {:.4}", report.accuracy);
            Ok((
                ValidationMetrics::Classification {
                    accuracy: report.accuracy,
                    report: report.clone(),
                },
                Some(report),
            ))
        }
    }
}

fn write_predictions(
    pipeline: &TrainedPipeline,
    dataset: &Dataset,
    path: &std::path::Path,
) -> Result<(), TrainerError> {
    let raw = pipeline.predict_raw(dataset.observations())?;
    let labels = pipeline.decode_labels(&raw)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)?;
    dataset.write_with_column(file, PREDICTION_COLUMN, &labels)?;
    info!("Predictions saved to: {}", path.display());
    Ok(())
}
