//! Moisture model used by the prediction endpoint.
//!
//! Loaded from disk on first use and swapped wholesale on reload. Readers
//! clone the inner `Arc`, so a reload never disturbs a prediction that is
//! already running.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use irrigation_ml::{load_pipeline, ArtifactError, TrainedPipeline};
use parking_lot::RwLock;
use tracing::info;

pub struct ModelHandle {
    path: PathBuf,
    current: RwLock<Option<Arc<TrainedPipeline>>>,
}

impl ModelHandle {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(None),
        }
    }

    /// Handle that starts out with `pipeline` already loaded.
    pub fn with_pipeline<P: Into<PathBuf>>(path: P, pipeline: TrainedPipeline) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Some(Arc::new(pipeline))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }

    /// Current pipeline, loading it if nothing has been loaded yet.
    pub async fn get(&self) -> Result<Arc<TrainedPipeline>, ArtifactError> {
        if let Some(pipeline) = self.current.read().clone() {
            return Ok(pipeline);
        }
        let loaded = self.load().await?;
        let mut guard = self.current.write();
        // Another request may have finished loading first.
        Ok(guard.get_or_insert(loaded).clone())
    }

    /// Read the artifact again and replace the current pipeline.
    pub async fn reload(&self) -> Result<Arc<TrainedPipeline>, ArtifactError> {
        let loaded = self.load().await?;
        *self.current.write() = Some(loaded.clone());
        info!("Reloaded model from {}", self.path.display());
        Ok(loaded)
    }

    async fn load(&self) -> Result<Arc<TrainedPipeline>, ArtifactError> {
        let path = self.path.clone();
        let pipeline = tokio::task::spawn_blocking(move || load_pipeline(path))
            .await
            .map_err(|err| {
                ArtifactError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
            })??;
        Ok(Arc::new(pipeline))
    }
}
