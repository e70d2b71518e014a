//! Artifact persistence
//!
//! A trained pipeline is stored as a bincode envelope (`<stem>.bin`) next
//! to a canonical JSON metadata record (`<stem>_metadata.json`). Both are
//! written to `.tmp` siblings and renamed into place once both writes
//! succeeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::ArtifactError;
use crate::features::Task;
use crate::metrics::ClassificationReport;
use crate::pipeline::TrainedPipeline;
use crate::serialization::canonical_json_bytes;

/// Binary layout version of the artifact envelope.
pub const FORMAT_VERSION: u32 = 1;

/// Default artifact directory, relative to the working directory.
pub const DEFAULT_MODEL_DIR: &str = "ai_models/saved_models";

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u32,
    pipeline: &'a TrainedPipeline,
}

#[derive(Deserialize)]
struct Envelope {
    format_version: u32,
    pipeline: TrainedPipeline,
}

/// Hyperparameters recorded in the metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: String,
    pub bootstrap: bool,
    pub random_state: u64,
    pub test_size: f64,
    pub cv_folds: usize,
}

/// Held-out metrics; the shape depends on the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidationMetrics {
    Regression {
        mse: f64,
        r2: f64,
    },
    Classification {
        accuracy: f64,
        report: ClassificationReport,
    },
}

/// Descriptive record written next to each artifact. Serving never reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub features: Vec<String>,
    pub encoded_features: Vec<String>,
    pub target: String,
    pub model_type: String,
    pub hyperparameters: Hyperparameters,
    pub validation_metrics: ValidationMetrics,
    pub cross_validation_scores: Vec<f64>,
    pub cross_validation_mean: f64,
    pub feature_importances: BTreeMap<String, f64>,
    pub n_samples: usize,
    pub n_train_samples: usize,
    pub n_test_samples: usize,
    /// BLAKE3 of the artifact bytes, hex encoded. Filled in on persist.
    #[serde(default)]
    pub artifact_hash: String,
    pub trained_at: DateTime<Utc>,
    pub trainer_version: String,
}

/// Locations of a persisted artifact pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedArtifact {
    pub model_path: PathBuf,
    pub metadata_path: PathBuf,
    pub hash: String,
}

/// Encode a pipeline into the versioned envelope.
pub fn encode_pipeline(pipeline: &TrainedPipeline) -> Result<Vec<u8>, ArtifactError> {
    Ok(bincode::serialize(&EnvelopeRef {
        format_version: FORMAT_VERSION,
        pipeline,
    })?)
}

/// Decode an envelope, rejecting unknown format versions before touching
/// the payload.
pub fn decode_pipeline(bytes: &[u8]) -> Result<TrainedPipeline, ArtifactError> {
    let found: u32 = bincode::deserialize(bytes)?;
    if found != FORMAT_VERSION {
        return Err(ArtifactError::UnsupportedVersion {
            found,
            expected: FORMAT_VERSION,
        });
    }
    let envelope: Envelope = bincode::deserialize(bytes)?;
    debug_assert_eq!(envelope.format_version, FORMAT_VERSION);
    Ok(envelope.pipeline)
}

pub fn artifact_hash(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

/// Load a pipeline from an artifact file.
pub fn load_pipeline<P: AsRef<Path>>(path: P) -> Result<TrainedPipeline, ArtifactError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ArtifactError::NotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let pipeline = decode_pipeline(&bytes)?;
    debug!(
        "Loaded {} pipeline from {} ({} trees)",
        pipeline.task(),
        path.display(),
        pipeline.forest().n_trees()
    );
    Ok(pipeline)
}

/// Directory holding the artifacts of every task.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_DIR)
    }
}

impl ArtifactStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self, task: Task) -> PathBuf {
        self.dir.join(format!("{}.bin", task.artifact_stem()))
    }

    pub fn metadata_path(&self, task: Task) -> PathBuf {
        self.dir.join(format!("{}_metadata.json", task.artifact_stem()))
    }

    /// Write the pipeline and its metadata, replacing any previous pair.
    pub fn persist(
        &self,
        pipeline: &TrainedPipeline,
        mut metadata: ModelMetadata,
    ) -> Result<PersistedArtifact, ArtifactError> {
        fs::create_dir_all(&self.dir)?;

        let task = pipeline.task();
        let model_path = self.model_path(task);
        let metadata_path = self.metadata_path(task);

        let bytes = encode_pipeline(pipeline)?;
        let hash = artifact_hash(&bytes);
        metadata.artifact_hash = hash.clone();
        let metadata_bytes = canonical_json_bytes(&metadata)?;

        let model_tmp = tmp_sibling(&model_path);
        let metadata_tmp = tmp_sibling(&metadata_path);

        let written = fs::write(&model_tmp, &bytes)
            .and_then(|_| fs::write(&metadata_tmp, &metadata_bytes))
            .and_then(|_| {
                commit_pair(&[
                    (model_tmp.as_path(), model_path.as_path()),
                    (metadata_tmp.as_path(), metadata_path.as_path()),
                ])
            });

        if let Err(err) = written {
            let _ = fs::remove_file(&model_tmp);
            let _ = fs::remove_file(&metadata_tmp);
            return Err(err.into());
        }

        info!("Model saved to {}", model_path.display());
        info!("Metadata saved to {}", metadata_path.display());

        Ok(PersistedArtifact {
            model_path,
            metadata_path,
            hash,
        })
    }

    pub fn load(&self, task: Task) -> Result<TrainedPipeline, ArtifactError> {
        load_pipeline(self.model_path(task))
    }

    pub fn load_metadata(&self, task: Task) -> Result<ModelMetadata, ArtifactError> {
        let path = self.metadata_path(task);
        if !path.exists() {
            return Err(ArtifactError::NotFound(path));
        }
        Ok(serde_json::from_slice(&fs::read(&path)?)?)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    sibling_with_suffix(path, ".tmp")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Move every `(source, target)` into place, or none of them.
///
/// Existing targets are parked as `.bak` siblings first. If any rename
/// fails, targets already replaced are removed and the parked files are
/// restored, so the previous model and metadata stay paired.
fn commit_pair(moves: &[(&Path, &Path)]) -> std::io::Result<()> {
    let mut parked: Vec<(PathBuf, &Path)> = Vec::new();
    let mut placed: Vec<&Path> = Vec::new();

    let result = (|| -> std::io::Result<()> {
        for &(_, target) in moves {
            if target.exists() {
                let backup = sibling_with_suffix(target, ".bak");
                fs::rename(target, &backup)?;
                parked.push((backup, target));
            }
        }
        for &(source, target) in moves {
            fs::rename(source, target)?;
            placed.push(target);
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            for (backup, _) in &parked {
                let _ = fs::remove_file(backup);
            }
            Ok(())
        }
        Err(err) => {
            warn!("Artifact commit failed, restoring previous files: {}", err);
            for target in placed {
                let _ = fs::remove_file(target);
            }
            for (backup, target) in &parked {
                let _ = fs::rename(backup, target);
            }
            Err(err)
        }
    }
}
