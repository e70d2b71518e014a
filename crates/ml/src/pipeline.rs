//! Training pipeline: preprocessing + forest (+ label encoder) as one unit
//!
//! [`PipelineConfig`] is the untrained pipeline. Fitting it on a set of rows
//! yields a [`TrainedPipeline`], the object that gets persisted and served.

use serde::{Deserialize, Serialize};

use crate::dataset::Observation;
use crate::errors::PipelineError;
use crate::features::{Sample, Task};
use crate::forest::{ForestKind, ForestParams, RandomForest};
use crate::metrics::{accuracy_score, r2_score};
use crate::preprocess::{LabelEncoder, Preprocessor};
use crate::validation::cross_validate;

/// Output of a trained pipeline for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prediction {
    Moisture(f64),
    Crop(String),
}

/// An unfitted pipeline. For classification the label encoder is fitted up
/// front on the full dataset so every fold shares one class index space.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub task: Task,
    pub params: ForestParams,
    labels: Option<LabelEncoder>,
}

impl PipelineConfig {
    pub fn new(task: Task, params: ForestParams, rows: &[Observation]) -> Self {
        let labels = task.is_classification().then(|| {
            LabelEncoder::fit(rows.iter().filter_map(|r| r.category(task.target())))
        });
        Self {
            task,
            params,
            labels,
        }
    }

    pub fn label_encoder(&self) -> Option<&LabelEncoder> {
        self.labels.as_ref()
    }

    /// Encoded target for each row: the value itself for regression, the
    /// class index for classification.
    pub fn targets(&self, rows: &[Observation]) -> Result<Vec<f64>, PipelineError> {
        let target = self.task.target();
        rows.iter()
            .map(|row| match &self.labels {
                Some(labels) => {
                    let label = row
                        .category(target)
                        .ok_or(PipelineError::MissingFeature(target.header()))?;
                    Ok(labels.encode(label)? as f64)
                }
                None => row
                    .numeric(target)
                    .ok_or(PipelineError::MissingFeature(target.header())),
            })
            .collect()
    }

    fn kind(&self) -> ForestKind {
        match &self.labels {
            Some(labels) => ForestKind::Classifier {
                n_classes: labels.n_classes(),
            },
            None => ForestKind::Regressor,
        }
    }

    /// Fit a fresh preprocessor and forest on `rows`.
    pub fn fit(&self, rows: &[Observation]) -> Result<TrainedPipeline, PipelineError> {
        let preprocessor = Preprocessor::fit(self.task.features(), rows)?;
        let x = preprocessor.transform(rows);
        let y = self.targets(rows)?;
        let forest = RandomForest::fit(self.kind(), &self.params, &x, &y)?;

        Ok(TrainedPipeline {
            task: self.task,
            preprocessor,
            forest,
            labels: self.labels.clone(),
        })
    }

    /// k-fold scores over `rows` in fold order: R² for regression,
    /// accuracy for classification.
    pub fn cross_validate(
        &self,
        rows: &[Observation],
        n_splits: usize,
    ) -> Result<Vec<f64>, PipelineError> {
        cross_validate(rows.len(), n_splits, |fold| {
            let train: Vec<Observation> = fold.train.iter().map(|&i| rows[i].clone()).collect();
            let test: Vec<Observation> = fold.test.iter().map(|&i| rows[i].clone()).collect();
            self.fit(&train)?.score(&test)
        })
    }
}

/// A fitted pipeline, applicable only to inputs with the fit-time schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedPipeline {
    task: Task,
    preprocessor: Preprocessor,
    forest: RandomForest,
    labels: Option<LabelEncoder>,
}

impl TrainedPipeline {
    pub fn task(&self) -> Task {
        self.task
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn forest(&self) -> &RandomForest {
        &self.forest
    }

    pub fn label_encoder(&self) -> Option<&LabelEncoder> {
        self.labels.as_ref()
    }

    pub fn encoded_feature_names(&self) -> Vec<String> {
        self.preprocessor.feature_names()
    }

    /// Raw model outputs: moisture values or class indices.
    pub fn predict_raw(&self, rows: &[Observation]) -> Result<Vec<f64>, PipelineError> {
        self.forest.predict(&self.preprocessor.transform(rows))
    }

    pub fn predict(&self, sample: &Sample) -> Result<Prediction, PipelineError> {
        let encoded = self.preprocessor.transform_sample(sample)?;
        let raw = self.forest.predict_row(&encoded)?;
        self.to_prediction(raw)
    }

    pub fn predict_moisture(&self, sample: &Sample) -> Result<f64, PipelineError> {
        match self.predict(sample)? {
            Prediction::Moisture(value) => Ok(value),
            Prediction::Crop(_) => Err(PipelineError::TaskMismatch(format!(
                "{} pipeline does not predict moisture",
                self.task
            ))),
        }
    }

    /// Class names for a slice of raw class indices.
    pub fn decode_labels(&self, raw: &[f64]) -> Result<Vec<String>, PipelineError> {
        raw.iter()
            .map(|&r| match self.to_prediction(r)? {
                Prediction::Crop(label) => Ok(label),
                Prediction::Moisture(_) => Err(PipelineError::TaskMismatch(format!(
                    "{} pipeline does not predict labels",
                    self.task
                ))),
            })
            .collect()
    }

    fn to_prediction(&self, raw: f64) -> Result<Prediction, PipelineError> {
        match &self.labels {
            None => Ok(Prediction::Moisture(raw)),
            Some(labels) => labels
                .decode(raw as usize)
                .map(|l| Prediction::Crop(l.to_string()))
                .ok_or_else(|| PipelineError::UnknownLabel(format!("class index {raw}"))),
        }
    }

    /// R² (regression) or accuracy (classification) on `rows`.
    pub fn score(&self, rows: &[Observation]) -> Result<f64, PipelineError> {
        let predicted = self.predict_raw(rows)?;
        let target = self.task.target();

        match &self.labels {
            None => {
                let actual: Vec<f64> = rows.iter().filter_map(|r| r.numeric(target)).collect();
                Ok(r2_score(&actual, &predicted))
            }
            Some(labels) => {
                let actual = rows
                    .iter()
                    .map(|r| {
                        r.category(target)
                            .ok_or(PipelineError::MissingFeature(target.header()))
                            .and_then(|l| labels.encode(l))
                    })
                    .collect::<Result<Vec<usize>, _>>()?;
                let predicted: Vec<usize> = predicted.iter().map(|&p| p as usize).collect();
                Ok(accuracy_score(&actual, &predicted))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Observation> {
        (0..40)
            .map(|i| {
                let wet = i % 2 == 0;
                Observation {
                    temperature: 20.0 + (i % 7) as f64,
                    humidity: if wet { 70.0 } else { 40.0 },
                    moisture: if wet { 60.0 } else { 20.0 },
                    soil_type: if wet { "Clayey" } else { "Sandy" }.to_string(),
                    crop_type: if wet { "Paddy" } else { "Millets" }.to_string(),
                }
            })
            .collect()
    }

    fn small_params() -> ForestParams {
        ForestParams {
            n_estimators: 10,
            ..ForestParams::regressor()
        }
    }

    #[test]
    fn test_regression_pipeline() {
        let data = rows();
        let config = PipelineConfig::new(Task::MoistureRegression, small_params(), &data);
        let pipeline = config.fit(&data).unwrap();

        let sample = Sample {
            temperature: Some(22.0),
            humidity: Some(70.0),
            soil_type: Some("Clayey".to_string()),
            crop_type: Some("Paddy".to_string()),
            ..Default::default()
        };
        let moisture = pipeline.predict_moisture(&sample).unwrap();
        assert!((moisture - 60.0).abs() < 1e-9);
        assert!(pipeline.score(&data).unwrap() > 0.99);
    }

    #[test]
    fn test_classification_pipeline() {
        let data = rows();
        let params = ForestParams {
            n_estimators: 10,
            ..ForestParams::classifier()
        };
        let config = PipelineConfig::new(Task::CropClassification, params, &data);
        let pipeline = config.fit(&data).unwrap();

        let sample = Sample {
            temperature: Some(22.0),
            humidity: Some(40.0),
            moisture: Some(20.0),
            soil_type: Some("Sandy".to_string()),
            ..Default::default()
        };
        assert_eq!(
            pipeline.predict(&sample).unwrap(),
            Prediction::Crop("Millets".to_string())
        );
        assert!(matches!(
            pipeline.predict_moisture(&sample),
            Err(PipelineError::TaskMismatch(_))
        ));
    }

    #[test]
    fn test_cross_validation_scores_every_fold() {
        let data = rows();
        let config = PipelineConfig::new(Task::MoistureRegression, small_params(), &data);
        let scores = config.cross_validate(&data, 5).unwrap();
        assert_eq!(scores.len(), 5);
        assert!(scores.iter().all(|s| s.is_finite() && *s <= 1.0));
    }
}
