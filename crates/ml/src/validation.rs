//! Train/test splitting and k-fold cross-validation

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::deterministic::permutation;
use crate::errors::PipelineError;

/// Row indices of one train/validation partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Seeded shuffle split. The test side gets `ceil(test_size * n)` rows and
/// both sides must be non-empty.
pub fn train_test_split(
    n_samples: usize,
    test_size: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), PipelineError> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(PipelineError::InvalidParameters(format!(
            "test_size must be in (0, 1), got {test_size}"
        )));
    }

    let n_test = (test_size * n_samples as f64).ceil() as usize;
    if n_test == 0 || n_test >= n_samples {
        return Err(PipelineError::InsufficientData(format!(
            "test_size {test_size} on {n_samples} rows leaves an empty train or test set"
        )));
    }

    let order = permutation(n_samples, seed);
    let (test, train) = order.split_at(n_test);
    Ok((train.to_vec(), test.to_vec()))
}

/// Contiguous, unshuffled k-fold partition. The first `n % k` folds get one
/// extra row.
pub fn k_fold(n_samples: usize, n_splits: usize) -> Result<Vec<Fold>, PipelineError> {
    if n_splits < 2 {
        return Err(PipelineError::InvalidParameters(
            "n_splits must be at least 2".to_string(),
        ));
    }
    if n_samples < n_splits {
        return Err(PipelineError::InsufficientData(format!(
            "n_samples ({n_samples}) must be >= n_splits ({n_splits})"
        )));
    }

    let base = n_samples / n_splits;
    let remainder = n_samples % n_splits;
    let mut folds = Vec::with_capacity(n_splits);
    let mut current = 0;

    for index in 0..n_splits {
        let size = if index < remainder { base + 1 } else { base };
        let test: Vec<usize> = (current..current + size).collect();
        let train: Vec<usize> = (0..current).chain(current + size..n_samples).collect();
        folds.push(Fold { index, train, test });
        current += size;
    }

    Ok(folds)
}

/// Score every fold with `score`, in parallel, returning scores in fold
/// order. The first failing fold aborts the whole evaluation.
pub fn cross_validate<F>(
    n_samples: usize,
    n_splits: usize,
    score: F,
) -> Result<Vec<f64>, PipelineError>
where
    F: Fn(&Fold) -> Result<f64, PipelineError> + Sync,
{
    let folds = k_fold(n_samples, n_splits)?;
    folds
        .par_iter()
        .map(|fold| {
            let value = score(fold)?;
            tracing::debug!("Fold {}/{}: {:.4}", fold.index + 1, n_splits, value);
            Ok(value)
        })
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sizes() {
        let (train, test) = train_test_split(100, 0.2, 42).unwrap();
        assert_eq!(test.len(), 20);
        assert_eq!(train.len(), 80);

        let (train, test) = train_test_split(11, 0.2, 42).unwrap();
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 8);
    }

    #[test]
    fn test_split_is_seeded() {
        assert_eq!(train_test_split(50, 0.3, 7).unwrap(), train_test_split(50, 0.3, 7).unwrap());
        assert_ne!(train_test_split(50, 0.3, 7).unwrap(), train_test_split(50, 0.3, 8).unwrap());
    }

    #[test]
    fn test_split_rejects_degenerate_sizes() {
        assert!(train_test_split(1, 0.2, 42).is_err());
        assert!(train_test_split(10, 0.0, 42).is_err());
        assert!(train_test_split(10, 1.0, 42).is_err());
    }

    #[test]
    fn test_k_fold_sizes() {
        let folds = k_fold(12, 5).unwrap();
        let sizes: Vec<usize> = folds.iter().map(|f| f.test.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2, 2]);
        assert_eq!(folds[0].test, vec![0, 1, 2]);
        assert_eq!(folds[1].train.len(), 9);
    }

    #[test]
    fn test_k_fold_needs_enough_rows() {
        assert!(k_fold(4, 5).is_err());
        assert!(k_fold(10, 1).is_err());
    }

    #[test]
    fn test_cross_validate_keeps_fold_order() {
        let scores = cross_validate(10, 5, |fold| Ok(fold.index as f64)).unwrap();
        assert_eq!(scores, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(mean(&scores), 2.0);
    }
}
