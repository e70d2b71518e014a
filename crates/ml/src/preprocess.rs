//! Feature encoding
//!
//! Categorical predictors are one-hot encoded (categories sorted within
//! each block), numeric predictors pass through. Categories never seen at
//! fit time encode as an all-zero block. Categorical targets go through a
//! [`LabelEncoder`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::dataset::{Column, Observation};
use crate::errors::PipelineError;
use crate::features::Sample;

/// One-hot encoder for a single categorical column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneHotEncoder {
    column: Column,
    categories: Vec<String>,
}

impl OneHotEncoder {
    pub fn fit<'a>(column: Column, values: impl IntoIterator<Item = &'a str>) -> Self {
        let categories = values
            .into_iter()
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self { column, categories }
    }

    pub fn column(&self) -> Column {
        self.column
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn width(&self) -> usize {
        self.categories.len()
    }

    /// Append the indicator block for `value` to `out`.
    pub fn encode_into(&self, value: &str, out: &mut Vec<f64>) {
        let hit = self
            .categories
            .binary_search_by(|c| c.as_str().cmp(value))
            .ok();
        out.extend((0..self.categories.len()).map(|i| if Some(i) == hit { 1.0 } else { 0.0 }));
    }

    pub fn feature_names(&self) -> impl Iterator<Item = String> + '_ {
        self.categories
            .iter()
            .map(move |c| format!("cat__{}_{}", self.column.header(), c))
    }
}

/// Column transformer fitted on the training rows of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    encoders: Vec<OneHotEncoder>,
    passthrough: Vec<Column>,
}

impl Preprocessor {
    pub fn fit(features: &[Column], rows: &[Observation]) -> Result<Self, PipelineError> {
        if rows.is_empty() {
            return Err(PipelineError::InsufficientData(
                "cannot fit a preprocessor on zero rows".to_string(),
            ));
        }

        let encoders = features
            .iter()
            .filter(|c| c.is_categorical())
            .map(|&column| {
                OneHotEncoder::fit(column, rows.iter().filter_map(|r| r.category(column)))
            })
            .collect();
        let passthrough = features
            .iter()
            .copied()
            .filter(|c| !c.is_categorical())
            .collect();

        Ok(Self {
            encoders,
            passthrough,
        })
    }

    pub fn width(&self) -> usize {
        self.encoders.iter().map(OneHotEncoder::width).sum::<usize>() + self.passthrough.len()
    }

    pub fn encoders(&self) -> &[OneHotEncoder] {
        &self.encoders
    }

    /// Encoded column names in output order.
    pub fn feature_names(&self) -> Vec<String> {
        self.encoders
            .iter()
            .flat_map(OneHotEncoder::feature_names)
            .chain(
                self.passthrough
                    .iter()
                    .map(|c| format!("remainder__{}", c.header())),
            )
            .collect()
    }

    /// Source column behind each encoded column.
    pub fn source_columns(&self) -> Vec<Column> {
        self.encoders
            .iter()
            .flat_map(|e| std::iter::repeat(e.column()).take(e.width()))
            .chain(self.passthrough.iter().copied())
            .collect()
    }

    pub fn transform_sample(&self, sample: &Sample) -> Result<Vec<f64>, PipelineError> {
        let mut row = Vec::with_capacity(self.width());
        for encoder in &self.encoders {
            encoder.encode_into(sample.category(encoder.column())?, &mut row);
        }
        for &column in &self.passthrough {
            row.push(sample.numeric(column)?);
        }
        Ok(row)
    }

    pub fn transform(&self, rows: &[Observation]) -> Vec<Vec<f64>> {
        rows.iter().map(|r| self.transform_observation(r)).collect()
    }

    fn transform_observation(&self, observation: &Observation) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.width());
        for encoder in &self.encoders {
            encoder.encode_into(observation.category(encoder.column()).unwrap_or(""), &mut row);
        }
        for &column in &self.passthrough {
            row.push(observation.numeric(column).unwrap_or(0.0));
        }
        row
    }
}

/// Invertible mapping between class names and class indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let classes = labels
            .into_iter()
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self { classes }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn encode(&self, label: &str) -> Result<usize, PipelineError> {
        self.classes
            .binary_search_by(|c| c.as_str().cmp(label))
            .map_err(|_| PipelineError::UnknownLabel(label.to_string()))
    }

    pub fn decode(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }
}
