//! Smart irrigation training pipeline
//!
//! Loads the plant observation table, fits deterministic random-forest
//! pipelines for soil moisture (regression) and crop type
//! (classification), evaluates them and persists the fitted pipeline with
//! a metadata record.

pub mod artifact;
pub mod cart;
pub mod dataset;
pub mod deterministic;
pub mod errors;
pub mod features;
pub mod forest;
pub mod metrics;
pub mod pipeline;
pub mod preprocess;
pub mod serialization;
pub mod trainer;
pub mod validation;

pub use artifact::{load_pipeline, ArtifactStore, ModelMetadata, ValidationMetrics};
pub use dataset::{Column, Dataset, Observation, ObservationTable};
pub use errors::{ArtifactError, DatasetError, PipelineError, TrainerError};
pub use features::{Sample, Task};
pub use forest::{ForestParams, MaxFeatures, RandomForest};
pub use pipeline::{PipelineConfig, Prediction, TrainedPipeline};
pub use trainer::{RunState, Trainer, TrainingConfig, TrainingReport};

/// Train one task end to end with the given configuration.
pub fn train(config: TrainingConfig) -> Result<TrainingReport, TrainerError> {
    Trainer::new(config).run()
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
