//! Task definitions and inference inputs
//!
//! A [`Task`] fixes which columns are predictors, which column is the
//! target and what kind of ensemble is fitted. Both tasks share the same
//! training harness.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dataset::{Column, Observation};
use crate::errors::PipelineError;

/// The two supported training tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Predict soil moisture from climate, soil and crop.
    MoistureRegression,
    /// Predict the crop type from climate, moisture and soil.
    CropClassification,
}

impl Task {
    pub fn features(self) -> &'static [Column] {
        match self {
            Task::MoistureRegression => &[
                Column::Temperature,
                Column::Humidity,
                Column::SoilType,
                Column::CropType,
            ],
            Task::CropClassification => &[
                Column::Temperature,
                Column::Humidity,
                Column::Moisture,
                Column::SoilType,
            ],
        }
    }

    pub fn target(self) -> Column {
        match self {
            Task::MoistureRegression => Column::Moisture,
            Task::CropClassification => Column::CropType,
        }
    }

    pub fn model_type(self) -> &'static str {
        match self {
            Task::MoistureRegression => "RandomForestRegressor",
            Task::CropClassification => "RandomForestClassifier",
        }
    }

    pub fn is_classification(self) -> bool {
        matches!(self, Task::CropClassification)
    }

    /// File stem for the artifact pair (`<stem>.bin`, `<stem>_metadata.json`).
    pub fn artifact_stem(self) -> &'static str {
        match self {
            Task::MoistureRegression => "plant_model",
            Task::CropClassification => "crop_model",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::MoistureRegression => write!(f, "moisture"),
            Task::CropClassification => write!(f, "crop"),
        }
    }
}

/// A single inference input. Only the columns a task uses need to be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default, alias = "Temparature")]
    pub temperature: Option<f64>,
    #[serde(default, alias = "Humidity")]
    pub humidity: Option<f64>,
    #[serde(default, alias = "Moisture")]
    pub moisture: Option<f64>,
    #[serde(default, alias = "Soil Type")]
    pub soil_type: Option<String>,
    #[serde(default, alias = "Crop Type")]
    pub crop_type: Option<String>,
}

impl Sample {
    pub fn numeric(&self, column: Column) -> Result<f64, PipelineError> {
        let value = match column {
            Column::Temperature => self.temperature,
            Column::Humidity => self.humidity,
            Column::Moisture => self.moisture,
            Column::SoilType | Column::CropType => None,
        };
        value.ok_or(PipelineError::MissingFeature(column.header()))
    }

    pub fn category(&self, column: Column) -> Result<&str, PipelineError> {
        let value = match column {
            Column::SoilType => self.soil_type.as_deref(),
            Column::CropType => self.crop_type.as_deref(),
            _ => None,
        };
        value.ok_or(PipelineError::MissingFeature(column.header()))
    }
}

impl From<&Observation> for Sample {
    fn from(o: &Observation) -> Self {
        Self {
            temperature: Some(o.temperature),
            humidity: Some(o.humidity),
            moisture: Some(o.moisture),
            soil_type: Some(o.soil_type.clone()),
            crop_type: Some(o.crop_type.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_never_use_target_as_feature() {
        for task in [Task::MoistureRegression, Task::CropClassification] {
            assert!(!task.features().contains(&task.target()));
        }
    }

    #[test]
    fn test_sample_reports_missing_feature() {
        let sample = Sample {
            temperature: Some(25.0),
            ..Default::default()
        };
        assert_eq!(sample.numeric(Column::Temperature).unwrap(), 25.0);
        assert!(matches!(
            sample.numeric(Column::Humidity),
            Err(PipelineError::MissingFeature("Humidity"))
        ));
        assert!(matches!(
            sample.category(Column::SoilType),
            Err(PipelineError::MissingFeature("Soil Type"))
        ));
    }

    #[test]
    fn test_sample_accepts_source_headers() {
        let sample: Sample = serde_json::from_str(
            r#"{"Temparature": 25.0, "humidity": 60.0, "Soil Type": "Loamy", "crop_type": "Wheat"}"#,
        )
        .unwrap();
        assert_eq!(sample.temperature, Some(25.0));
        assert_eq!(sample.soil_type.as_deref(), Some("Loamy"));
        assert_eq!(sample.moisture, None);
    }
}
