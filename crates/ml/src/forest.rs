//! Random forest ensembles
//!
//! Bootstrap aggregation over [`CartBuilder`] trees. Every tree owns a
//! seed derived from `(random_state, tree index)`, so trees can be fitted
//! on the rayon pool without changing the result.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cart::{CartBuilder, Criterion, Tree, TreeConfig};
use crate::deterministic::{derive_seed, LcgRng};
use crate::errors::PipelineError;

/// Strategy for the number of features examined per split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MaxFeatures {
    All,
    Sqrt,
    Log2,
    Fixed(usize),
    Fraction(f64),
}

impl MaxFeatures {
    pub fn resolve(self, n_features: usize) -> usize {
        let n = n_features as f64;
        let count = match self {
            MaxFeatures::All => n_features,
            MaxFeatures::Sqrt => n.sqrt().floor() as usize,
            MaxFeatures::Log2 => n.log2().floor() as usize,
            MaxFeatures::Fixed(k) => k,
            MaxFeatures::Fraction(f) => (n * f).floor() as usize,
        };
        count.clamp(1, n_features.max(1))
    }
}

impl fmt::Display for MaxFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxFeatures::All => write!(f, "all"),
            MaxFeatures::Sqrt => write!(f, "sqrt"),
            MaxFeatures::Log2 => write!(f, "log2"),
            MaxFeatures::Fixed(k) => write!(f, "{k}"),
            MaxFeatures::Fraction(v) => write!(f, "{v}"),
        }
    }
}

impl FromStr for MaxFeatures {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "none" => Ok(MaxFeatures::All),
            "sqrt" => Ok(MaxFeatures::Sqrt),
            "log2" => Ok(MaxFeatures::Log2),
            other => {
                if let Ok(k) = other.parse::<usize>() {
                    return Ok(MaxFeatures::Fixed(k));
                }
                match other.parse::<f64>() {
                    Ok(v) if v > 0.0 && v <= 1.0 => Ok(MaxFeatures::Fraction(v)),
                    _ => Err(format!(
                        "invalid max features {s:?} (expected all, sqrt, log2, an integer or a fraction in (0, 1])"
                    )),
                }
            }
        }
    }
}

/// Forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    pub random_state: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self::regressor()
    }
}

impl ForestParams {
    pub fn regressor() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::All,
            bootstrap: true,
            random_state: 42,
        }
    }

    pub fn classifier() -> Self {
        Self {
            max_features: MaxFeatures::Sqrt,
            ..Self::regressor()
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.n_estimators == 0 {
            return Err(PipelineError::InvalidParameters(
                "n_estimators must be at least 1".to_string(),
            ));
        }
        if self.max_depth == Some(0) {
            return Err(PipelineError::InvalidParameters(
                "max_depth must be at least 1".to_string(),
            ));
        }
        if self.min_samples_split < 2 {
            return Err(PipelineError::InvalidParameters(
                "min_samples_split must be at least 2".to_string(),
            ));
        }
        if self.min_samples_leaf == 0 {
            return Err(PipelineError::InvalidParameters(
                "min_samples_leaf must be at least 1".to_string(),
            ));
        }
        match self.max_features {
            MaxFeatures::Fixed(0) => Err(PipelineError::InvalidParameters(
                "max_features must be at least 1".to_string(),
            )),
            MaxFeatures::Fraction(f) if !(f > 0.0 && f <= 1.0) => {
                Err(PipelineError::InvalidParameters(
                    "max_features fraction must be in (0, 1]".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// What the forest predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForestKind {
    Regressor,
    /// Targets are class indices in `0..n_classes`.
    Classifier { n_classes: usize },
}

impl ForestKind {
    fn criterion(self) -> Criterion {
        match self {
            ForestKind::Regressor => Criterion::SquaredError,
            ForestKind::Classifier { n_classes } => Criterion::Gini { n_classes },
        }
    }
}

/// A fitted forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    kind: ForestKind,
    params: ForestParams,
    n_features: usize,
    trees: Vec<Tree>,
    feature_importances: Vec<f64>,
}

impl RandomForest {
    /// Fit a forest on encoded rows `x` and targets `y`.
    pub fn fit(
        kind: ForestKind,
        params: &ForestParams,
        x: &[Vec<f64>],
        y: &[f64],
    ) -> Result<Self, PipelineError> {
        params.validate()?;

        let n_samples = x.len();
        if n_samples == 0 {
            return Err(PipelineError::InsufficientData(
                "cannot fit a forest on zero rows".to_string(),
            ));
        }
        if y.len() != n_samples {
            return Err(PipelineError::Shape {
                expected: n_samples,
                actual: y.len(),
            });
        }
        let n_features = x[0].len();
        if let Some(row) = x.iter().find(|r| r.len() != n_features) {
            return Err(PipelineError::Shape {
                expected: n_features,
                actual: row.len(),
            });
        }
        if let ForestKind::Classifier { n_classes } = kind {
            if let Some(&bad) = y
                .iter()
                .find(|&&t| t < 0.0 || t.fract() != 0.0 || t as usize >= n_classes)
            {
                return Err(PipelineError::UnknownLabel(format!("class index {bad}")));
            }
        }

        let tree_config = TreeConfig {
            max_depth: params.max_depth,
            min_samples_split: params.min_samples_split,
            min_samples_leaf: params.min_samples_leaf,
            max_features: params.max_features.resolve(n_features),
            criterion: kind.criterion(),
        };

        let fitted: Vec<(Tree, Vec<f64>)> = (0..params.n_estimators)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = LcgRng::new(derive_seed(params.random_state, tree_idx as u64));

                let sample_indices: Vec<usize> = if params.bootstrap {
                    (0..n_samples).map(|_| rng.next_range(n_samples)).collect()
                } else {
                    (0..n_samples).collect()
                };

                let builder = CartBuilder::new(x, y, tree_config.clone());
                let (tree, importances) = builder.build(&sample_indices, &mut rng);
                tracing::debug!(
                    "Fitted tree {}/{} ({} leaves, depth {})",
                    tree_idx + 1,
                    params.n_estimators,
                    tree.leaf_count(),
                    tree.depth()
                );
                (tree, importances)
            })
            .collect();

        let feature_importances = aggregate_importances(
            fitted.iter().map(|(_, imp)| imp.as_slice()),
            n_features,
        );
        let trees = fitted.into_iter().map(|(tree, _)| tree).collect();

        Ok(Self {
            kind,
            params: params.clone(),
            n_features,
            trees,
            feature_importances,
        })
    }

    pub fn kind(&self) -> ForestKind {
        self.kind
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    /// Normalised impurity-decrease importance per encoded feature.
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    /// Mean of the tree outputs (regression) or the majority class index
    /// (classification, ties to the lowest index).
    pub fn predict_row(&self, row: &[f64]) -> Result<f64, PipelineError> {
        if row.len() != self.n_features {
            return Err(PipelineError::Shape {
                expected: self.n_features,
                actual: row.len(),
            });
        }

        match self.kind {
            ForestKind::Regressor => {
                let sum: f64 = self.trees.iter().map(|t| t.predict(row)).sum();
                Ok(sum / self.trees.len().max(1) as f64)
            }
            ForestKind::Classifier { n_classes } => {
                let mut votes = vec![0usize; n_classes.max(1)];
                for tree in &self.trees {
                    if let Some(v) = votes.get_mut(tree.predict(row) as usize) {
                        *v += 1;
                    }
                }
                let mut best = 0usize;
                for (idx, &count) in votes.iter().enumerate() {
                    if count > votes[best] {
                        best = idx;
                    }
                }
                Ok(best as f64)
            }
        }
    }

    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, PipelineError> {
        x.iter().map(|row| self.predict_row(row)).collect()
    }
}

fn aggregate_importances<'a>(
    per_tree: impl Iterator<Item = &'a [f64]>,
    n_features: usize,
) -> Vec<f64> {
    let mut total = vec![0.0; n_features];
    let mut n_trees = 0usize;

    for importances in per_tree {
        n_trees += 1;
        let sum: f64 = importances.iter().sum();
        if sum <= 0.0 {
            continue;
        }
        for (acc, &value) in total.iter_mut().zip(importances) {
            *acc += value / sum;
        }
    }

    if n_trees > 0 {
        for value in &mut total {
            *value /= n_trees as f64;
        }
    }

    let sum: f64 = total.iter().sum();
    if sum > 0.0 {
        for value in &mut total {
            *value /= sum;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let y: Vec<f64> = (0..40).map(|i| if i < 20 { 10.0 } else { 50.0 }).collect();
        (x, y)
    }

    #[test]
    fn test_regressor_learns_step() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 20,
            ..ForestParams::regressor()
        };
        let forest = RandomForest::fit(ForestKind::Regressor, &params, &x, &y).unwrap();

        assert_eq!(forest.n_trees(), 20);
        assert!(forest.predict_row(&[2.0, 2.0]).unwrap() < 20.0);
        assert!(forest.predict_row(&[37.0, 1.0]).unwrap() > 40.0);

        let importances = forest.feature_importances();
        let total: f64 = importances.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(importances[0] > importances[1]);
    }

    #[test]
    fn test_classifier_majority_vote() {
        let x: Vec<Vec<f64>> = (0..30).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..30).map(|i| (i / 10) as f64).collect();
        let params = ForestParams {
            n_estimators: 15,
            ..ForestParams::classifier()
        };
        let forest =
            RandomForest::fit(ForestKind::Classifier { n_classes: 3 }, &params, &x, &y).unwrap();

        assert_eq!(forest.predict_row(&[1.0]).unwrap(), 0.0);
        assert_eq!(forest.predict_row(&[15.0]).unwrap(), 1.0);
        assert_eq!(forest.predict_row(&[28.0]).unwrap(), 2.0);
    }

    #[test]
    fn test_same_seed_same_forest() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 8,
            ..ForestParams::regressor()
        };
        let a = RandomForest::fit(ForestKind::Regressor, &params, &x, &y).unwrap();
        let b = RandomForest::fit(ForestKind::Regressor, &params, &x, &y).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 2,
            ..ForestParams::regressor()
        };
        let forest = RandomForest::fit(ForestKind::Regressor, &params, &x, &y).unwrap();
        assert!(matches!(
            forest.predict_row(&[1.0]),
            Err(PipelineError::Shape { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_invalid_params() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 0,
            ..ForestParams::regressor()
        };
        assert!(matches!(
            RandomForest::fit(ForestKind::Regressor, &params, &x, &y),
            Err(PipelineError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_max_features_parsing() {
        assert_eq!("sqrt".parse::<MaxFeatures>().unwrap(), MaxFeatures::Sqrt);
        assert_eq!("ALL".parse::<MaxFeatures>().unwrap(), MaxFeatures::All);
        assert_eq!("3".parse::<MaxFeatures>().unwrap(), MaxFeatures::Fixed(3));
        assert_eq!("0.5".parse::<MaxFeatures>().unwrap(), MaxFeatures::Fraction(0.5));
        assert!("many".parse::<MaxFeatures>().is_err());
        assert_eq!(MaxFeatures::Sqrt.resolve(10), 3);
        assert_eq!(MaxFeatures::Fixed(50).resolve(10), 10);
    }
}
