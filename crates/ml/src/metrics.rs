//! Evaluation metrics
//!
//! Regression: mean squared error and R². Classification: accuracy and a
//! per-class precision/recall/F1 report with macro and weighted averages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean squared error. Returns 0 for empty input.
pub fn mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let sum: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    sum / y_true.len() as f64
}

/// Coefficient of determination. A constant target scores 1.0 when
/// predicted perfectly and 0.0 otherwise.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean) * (t - mean)).sum();

    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Fraction of exact matches.
pub fn accuracy_score(y_true: &[usize], y_pred: &[usize]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let hits = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    hits as f64 / y_true.len() as f64
}

/// Scores for one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

/// Averaged precision/recall/F1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AverageMetrics,
    pub weighted_avg: AverageMetrics,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl ClassificationReport {
    /// Build a report for class indices `0..labels.len()`. Classes with no
    /// support and no predictions are left out, as are out-of-range indices.
    pub fn new(y_true: &[usize], y_pred: &[usize], labels: &[String]) -> Self {
        let n = labels.len();
        let mut true_pos = vec![0usize; n];
        let mut predicted = vec![0usize; n];
        let mut support = vec![0usize; n];

        for (&t, &p) in y_true.iter().zip(y_pred) {
            if t < n {
                support[t] += 1;
            }
            if p < n {
                predicted[p] += 1;
            }
            if t == p && t < n {
                true_pos[t] += 1;
            }
        }

        let classes: Vec<ClassMetrics> = (0..n)
            .filter(|&c| support[c] > 0 || predicted[c] > 0)
            .map(|c| {
                let precision = ratio(true_pos[c], predicted[c]);
                let recall = ratio(true_pos[c], support[c]);
                let f1_score = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label: labels[c].clone(),
                    precision,
                    recall,
                    f1_score,
                    support: support[c],
                }
            })
            .collect();

        let total: usize = classes.iter().map(|c| c.support).sum();
        let k = classes.len().max(1) as f64;
        let macro_avg = AverageMetrics {
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / k,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / k,
            f1_score: classes.iter().map(|c| c.f1_score).sum::<f64>() / k,
            support: total,
        };
        let weight = |f: fn(&ClassMetrics) -> f64| -> f64 {
            if total == 0 {
                return 0.0;
            }
            classes.iter().map(|c| f(c) * c.support as f64).sum::<f64>() / total as f64
        };
        let weighted_avg = AverageMetrics {
            precision: weight(|c| c.precision),
            recall: weight(|c| c.recall),
            f1_score: weight(|c| c.f1_score),
            support: total,
        };

        Self {
            accuracy: accuracy_score(y_true, y_pred),
            classes,
            macro_avg,
            weighted_avg,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.label.len())
            .chain(["weighted avg".len()])
            .max()
            .unwrap_or(12);

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for c in &self.classes {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                c.label, c.precision, c.recall, c.f1_score, c.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        for (name, avg) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                name, avg.precision, avg.recall, avg.f1_score, avg.support
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regression_metrics() {
        let y_true = [3.0, -0.5, 2.0, 7.0];
        let y_pred = [2.5, 0.0, 2.0, 8.0];
        assert!((mean_squared_error(&y_true, &y_pred) - 0.375).abs() < 1e-12);
        assert!((r2_score(&y_true, &y_pred) - 0.948_608_137_044_967_9).abs() < 1e-9);
    }

    #[test]
    fn test_r2_constant_target() {
        assert_eq!(r2_score(&[5.0, 5.0], &[5.0, 5.0]), 1.0);
        assert_eq!(r2_score(&[5.0, 5.0], &[4.0, 5.0]), 0.0);
    }

    #[test]
    fn test_classification_report() {
        let labels: Vec<String> = ["Cotton", "Maize", "Wheat"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let y_true = [0, 1, 2, 2, 2];
        let y_pred = [0, 0, 2, 2, 1];
        let report = ClassificationReport::new(&y_true, &y_pred, &labels);

        assert_eq!(report.classes.len(), 3);
        assert!((report.accuracy - 0.6).abs() < 1e-12);

        let cotton = &report.classes[0];
        assert_eq!(cotton.precision, 0.5);
        assert_eq!(cotton.recall, 1.0);
        assert_eq!(cotton.support, 1);

        let maize = &report.classes[1];
        assert_eq!(maize.precision, 0.0);
        assert_eq!(maize.f1_score, 0.0);

        let wheat = &report.classes[2];
        assert_eq!(wheat.precision, 1.0);
        assert!((wheat.recall - 2.0 / 3.0).abs() < 1e-12);

        assert_eq!(report.weighted_avg.support, 5);
        assert!(report.to_string().contains("weighted avg"));
    }
}
