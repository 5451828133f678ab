//! Run metrics over a closed ledger.
//!
//! Separability metrics treat OOD as the positive class:
//! - ROC curve and AUROC (trapezoidal, tied scores form one diagonal step)
//! - PR curve and AUPR (interpolated precision, trapezoidal over recall)
//! - Per-group score statistics with bootstrap confidence intervals
//! - Welch t-test of OOD vs ID scores
//! - Score histogram for external plotting

use crate::config::OodConfig;
use crate::dataset::CorpusLabel;
use crate::decision::ScoreMethod;
use crate::ledger::ClosedLedger;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use thiserror::Error;

/// Errors that can occur while computing run metrics
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    #[error("No {0} samples in the ledger; metrics need both groups")]
    EmptyGroup(CorpusLabel),

    #[error("Non-finite score in the ledger: {0}")]
    NonFiniteScore(f64),
}

/// Compute mean of samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Compute sample standard deviation (n - 1)
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_std(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = compute_mean(samples);
    let variance =
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
    variance.sqrt()
}

/// Statistical configuration for the inferential parts of the metrics
#[derive(Debug, Clone)]
pub struct StatConfig {
    /// Number of bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level (e.g., 0.95)
    pub confidence: f64,
    /// Significance threshold
    pub alpha: f64,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            bootstrap_n: 1_000,
            confidence: 0.95,
            alpha: 0.05,
            seed: 42,
        }
    }
}

impl StatConfig {
    #[must_use]
    pub fn from_config(config: &OodConfig) -> Self {
        Self {
            bootstrap_n: config.bootstrap_n,
            confidence: config.confidence,
            seed: config.seed,
            ..Self::default()
        }
    }
}

/// Bootstrap confidence interval of the mean (percentile method)
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]
pub fn bootstrap_ci(samples: &[f64], config: &StatConfig) -> (f64, f64) {
    if samples.len() < 2 || config.bootstrap_n == 0 {
        let mean = compute_mean(samples);
        return (mean, mean);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut bootstrap_means = Vec::with_capacity(config.bootstrap_n);

    // Resample with replacement
    for _ in 0..config.bootstrap_n {
        let resample_sum: f64 = (0..samples.len())
            .map(|_| {
                let idx = rng.next_u64() as usize % samples.len();
                samples[idx]
            })
            .sum();
        bootstrap_means.push(resample_sum / samples.len() as f64);
    }

    bootstrap_means.sort_by(f64::total_cmp);

    let alpha = 1.0 - config.confidence;
    let lower_idx = (config.bootstrap_n as f64 * (alpha / 2.0)).floor() as usize;
    let upper_idx = (config.bootstrap_n as f64 * (1.0 - alpha / 2.0)).ceil() as usize;

    let lower = bootstrap_means.get(lower_idx).copied().unwrap_or(0.0);
    let upper = bootstrap_means
        .get(upper_idx.min(bootstrap_means.len() - 1))
        .copied()
        .unwrap_or(0.0);

    (lower, upper)
}

/// Result of a significance test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceResult {
    /// t-statistic
    pub t_statistic: f64,
    /// p-value
    pub p_value: f64,
    /// Degrees of freedom
    pub degrees_of_freedom: f64,
    /// Is result significant at the given alpha?
    pub is_significant: bool,
    /// Cohen's d effect size
    pub cohens_d: f64,
    /// Effect size interpretation
    pub effect_interpretation: String,
}

/// Independent samples t-test (Welch's t-test)
///
/// Returns `None` if either group has fewer than two samples or both have
/// no variance.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::suboptimal_flops)]
pub fn welch_t_test(
    samples_a: &[f64],
    samples_b: &[f64],
    alpha: f64,
) -> Option<SignificanceResult> {
    if samples_a.len() < 2 || samples_b.len() < 2 {
        return None;
    }

    let n_a = samples_a.len() as f64;
    let n_b = samples_b.len() as f64;
    let mean_a = compute_mean(samples_a);
    let mean_b = compute_mean(samples_b);
    let var_a = compute_std(samples_a).powi(2);
    let var_b = compute_std(samples_b).powi(2);

    if var_a < f64::EPSILON && var_b < f64::EPSILON {
        return None;
    }

    let se = ((var_a / n_a) + (var_b / n_b)).sqrt();
    if se < f64::EPSILON {
        return None;
    }

    let t_statistic = (mean_a - mean_b) / se;

    // Welch-Satterthwaite degrees of freedom
    let df_num = ((var_a / n_a) + (var_b / n_b)).powi(2);
    let df_denom = ((var_a / n_a).powi(2) / (n_a - 1.0)) + ((var_b / n_b).powi(2) / (n_b - 1.0));
    let df = if df_denom > f64::EPSILON {
        df_num / df_denom
    } else {
        (n_a + n_b - 2.0).max(1.0)
    };

    let t_dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p_value = 2.0 * (1.0 - t_dist.cdf(t_statistic.abs()));

    // Pooled Cohen's d
    let pooled_std = (((n_a - 1.0) * var_a + (n_b - 1.0) * var_b) / (n_a + n_b - 2.0)).sqrt();
    let cohens_d = if pooled_std > f64::EPSILON {
        (mean_a - mean_b) / pooled_std
    } else {
        0.0
    };

    Some(SignificanceResult {
        t_statistic,
        p_value,
        degrees_of_freedom: df,
        is_significant: p_value < alpha,
        cohens_d,
        effect_interpretation: interpret_cohens_d(cohens_d),
    })
}

/// Interpret Cohen's d effect size
fn interpret_cohens_d(d: f64) -> String {
    let abs_d = d.abs();
    if abs_d < 0.2 {
        "negligible".to_string()
    } else if abs_d < 0.5 {
        "small".to_string()
    } else if abs_d < 0.8 {
        "medium".to_string()
    } else {
        "large".to_string()
    }
}

// =============================================================================
// Curves
// =============================================================================

/// One point of the ROC curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub fpr: f64,
    pub tpr: f64,
    /// Scores `>=` this value are called OOD; `None` at the origin
    pub threshold: Option<f64>,
}

/// One point of the precision-recall curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrPoint {
    pub recall: f64,
    pub precision: f64,
    /// Highest precision at this recall or beyond
    pub interpolated_precision: f64,
    /// `None` at the (recall 0, precision 1) start point
    pub threshold: Option<f64>,
}

/// Cumulative confusion counts at one distinct threshold
struct SweepStep {
    threshold: f64,
    true_positives: usize,
    false_positives: usize,
}

struct Sweep {
    positives: usize,
    negatives: usize,
    steps: Vec<SweepStep>,
}

/// Walk distinct scores from high to low, one step per distinct score
#[allow(clippy::float_cmp)]
fn sweep(labeled: &[(bool, f64)]) -> Result<Sweep, MetricsError> {
    if let Some(&(_, bad)) = labeled.iter().find(|(_, s)| !s.is_finite()) {
        return Err(MetricsError::NonFiniteScore(bad));
    }
    let positives = labeled.iter().filter(|(ood, _)| *ood).count();
    let negatives = labeled.len() - positives;
    if negatives == 0 {
        return Err(MetricsError::EmptyGroup(CorpusLabel::Id));
    }
    if positives == 0 {
        return Err(MetricsError::EmptyGroup(CorpusLabel::Ood));
    }

    let mut sorted = labeled.to_vec();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut steps = Vec::new();
    let (mut tp, mut fp) = (0, 0);
    let mut i = 0;
    while i < sorted.len() {
        let threshold = sorted[i].1;
        while i < sorted.len() && sorted[i].1 == threshold {
            if sorted[i].0 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        steps.push(SweepStep {
            threshold,
            true_positives: tp,
            false_positives: fp,
        });
    }

    Ok(Sweep {
        positives,
        negatives,
        steps,
    })
}

/// ROC curve from `(is_ood, score)` pairs, starting at (0, 0)
///
/// # Errors
///
/// Returns `MetricsError::EmptyGroup` if either class is absent, or
/// `MetricsError::NonFiniteScore` for NaN or infinite scores.
#[allow(clippy::cast_precision_loss)]
pub fn roc_curve(labeled: &[(bool, f64)]) -> Result<Vec<RocPoint>, MetricsError> {
    let sweep = sweep(labeled)?;
    let p = sweep.positives as f64;
    let n = sweep.negatives as f64;

    let mut points = Vec::with_capacity(sweep.steps.len() + 1);
    points.push(RocPoint {
        fpr: 0.0,
        tpr: 0.0,
        threshold: None,
    });
    points.extend(sweep.steps.iter().map(|step| RocPoint {
        fpr: step.false_positives as f64 / n,
        tpr: step.true_positives as f64 / p,
        threshold: Some(step.threshold),
    }));
    Ok(points)
}

/// Precision-recall curve from `(is_ood, score)` pairs
///
/// # Errors
///
/// Same as [`roc_curve`].
#[allow(clippy::cast_precision_loss)]
pub fn pr_curve(labeled: &[(bool, f64)]) -> Result<Vec<PrPoint>, MetricsError> {
    let sweep = sweep(labeled)?;
    let p = sweep.positives as f64;

    let mut points = Vec::with_capacity(sweep.steps.len() + 1);
    points.push(PrPoint {
        recall: 0.0,
        precision: 1.0,
        interpolated_precision: 1.0,
        threshold: None,
    });
    for step in &sweep.steps {
        let called = (step.true_positives + step.false_positives) as f64;
        let precision = step.true_positives as f64 / called;
        points.push(PrPoint {
            recall: step.true_positives as f64 / p,
            precision,
            interpolated_precision: precision,
            threshold: Some(step.threshold),
        });
    }

    // Running maximum from the high-recall end
    let mut best = 0.0_f64;
    for point in points.iter_mut().rev() {
        best = best.max(point.precision);
        point.interpolated_precision = best;
    }
    Ok(points)
}

/// Trapezoidal area under a piecewise-linear curve
#[must_use]
pub fn trapezoid(points: impl IntoIterator<Item = (f64, f64)>) -> f64 {
    let mut area = 0.0;
    let mut previous: Option<(f64, f64)> = None;
    for (x, y) in points {
        if let Some((px, py)) = previous {
            area += (x - px) * (y + py) / 2.0;
        }
        previous = Some((x, y));
    }
    area
}

/// Area under the ROC curve
///
/// # Errors
///
/// Same as [`roc_curve`].
pub fn auroc(labeled: &[(bool, f64)]) -> Result<f64, MetricsError> {
    Ok(trapezoid(roc_curve(labeled)?.iter().map(|p| (p.fpr, p.tpr))))
}

/// Area under the interpolated precision-recall curve
///
/// # Errors
///
/// Same as [`roc_curve`].
pub fn aupr(labeled: &[(bool, f64)]) -> Result<f64, MetricsError> {
    Ok(trapezoid(
        pr_curve(labeled)?
            .iter()
            .map(|p| (p.recall, p.interpolated_precision)),
    ))
}

// =============================================================================
// Group statistics and histogram
// =============================================================================

/// Summary of one true-label group's scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub label: CorpusLabel,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    /// Bootstrap confidence interval of the mean
    pub mean_ci: (f64, f64),
    /// Samples whose decision was OOD
    pub flagged_ood: usize,
}

impl GroupStats {
    fn compute(ledger: &ClosedLedger, label: CorpusLabel, stats: &StatConfig) -> Self {
        let scores = ledger.scores_for(label);
        let flagged_ood = ledger
            .records()
            .iter()
            .filter(|r| r.label == label && r.decision.is_ood())
            .count();
        Self {
            label,
            count: scores.len(),
            mean: compute_mean(&scores),
            std: compute_std(&scores),
            min: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean_ci: bootstrap_ci(&scores, stats),
            flagged_ood,
        }
    }
}

/// Equal-width score histogram, counted per group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// `bins + 1` bin edges
    pub edges: Vec<f64>,
    pub id_counts: Vec<usize>,
    pub ood_counts: Vec<usize>,
    pub threshold: f64,
}

impl Histogram {
    /// Bin `(is_ood, score)` pairs over `[min, max]` of all scores
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn new(labeled: &[(bool, f64)], bins: usize, threshold: f64) -> Self {
        let bins = bins.max(1);
        let min = labeled.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
        let max = labeled
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        let (min, span) = if labeled.is_empty() {
            (0.0, 1.0)
        } else if max > min {
            (min, max - min)
        } else {
            // all scores equal
            (min, 1.0)
        };
        let width = span / bins as f64;

        let edges = (0..=bins).map(|i| width.mul_add(i as f64, min)).collect();
        let mut id_counts = vec![0; bins];
        let mut ood_counts = vec![0; bins];
        for &(ood, score) in labeled {
            let index = (((score - min) / width).floor() as usize).min(bins - 1);
            if ood {
                ood_counts[index] += 1;
            } else {
                id_counts[index] += 1;
            }
        }

        Self {
            edges,
            id_counts,
            ood_counts,
            threshold,
        }
    }

    #[must_use]
    pub fn bins(&self) -> usize {
        self.id_counts.len()
    }
}

// =============================================================================
// Run metrics
// =============================================================================

/// Read-only summary of a closed ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub method: ScoreMethod,
    pub threshold: f64,
    pub auroc: f64,
    pub aupr: f64,
    /// Fraction of records whose decision matches the true label
    pub accuracy: f64,
    pub id: GroupStats,
    pub ood: GroupStats,
    pub roc: Vec<RocPoint>,
    pub pr: Vec<PrPoint>,
    pub histogram: Histogram,
    /// Welch t-test of OOD scores against ID scores
    pub significance: Option<SignificanceResult>,
}

impl RunMetrics {
    /// Compute all metrics for a closed ledger
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::EmptyGroup` if either true-label group is
    /// empty, or `MetricsError::NonFiniteScore` for an invalid score.
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(
        ledger: &ClosedLedger,
        threshold: f64,
        config: &OodConfig,
    ) -> Result<Self, MetricsError> {
        let labeled = ledger.labeled_scores();
        let roc = roc_curve(&labeled)?;
        let pr = pr_curve(&labeled)?;
        let auroc = trapezoid(roc.iter().map(|p| (p.fpr, p.tpr)));
        let aupr = trapezoid(pr.iter().map(|p| (p.recall, p.interpolated_precision)));

        let stats = StatConfig::from_config(config);
        let id = GroupStats::compute(ledger, CorpusLabel::Id, &stats);
        let ood = GroupStats::compute(ledger, CorpusLabel::Ood, &stats);
        let significance = welch_t_test(
            &ledger.scores_for(CorpusLabel::Ood),
            &ledger.scores_for(CorpusLabel::Id),
            stats.alpha,
        );
        let correct = ledger.len() - ledger.misclassified();

        Ok(Self {
            method: ledger.method(),
            threshold,
            auroc,
            aupr,
            accuracy: correct as f64 / ledger.len() as f64,
            id,
            ood,
            roc,
            pr,
            histogram: Histogram::new(&labeled, config.histogram_bins, threshold),
            significance,
        })
    }

    /// Serialize to pretty JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
#[allow(
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::cast_lossless,
    clippy::unwrap_used
)]
mod tests {
    use super::*;
    use crate::decision::Decision;
    use crate::ledger::{EvaluationRecord, Ledger};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn labeled(id: &[f64], ood: &[f64]) -> Vec<(bool, f64)> {
        id.iter()
            .map(|s| (false, *s))
            .chain(ood.iter().map(|s| (true, *s)))
            .collect()
    }

    /// Mann-Whitney probability with ties counted as one half
    fn pairwise_auroc(id: &[f64], ood: &[f64]) -> f64 {
        let mut wins = 0.0;
        for o in ood {
            for i in id {
                if o > i {
                    wins += 1.0;
                } else if o == i {
                    wins += 0.5;
                }
            }
        }
        wins / (id.len() * ood.len()) as f64
    }

    // =========================================================================
    // Statistical functions tests
    // =========================================================================

    #[test]
    fn test_compute_std() {
        let samples = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let std = compute_std(&samples);
        // Sample std for this data is ~2.138
        assert!(std > 2.0 && std < 2.2, "std = {std}");
        assert_eq!(compute_std(&[5.0]), 0.0);
        assert_eq!(compute_mean(&[]), 0.0);
    }

    #[test]
    fn test_bootstrap_ci_reproducible() {
        let samples: Vec<f64> = (0..100).map(|i| 0.9 + (i as f64 * 0.001)).collect();
        let config = StatConfig::default();

        let (lower1, upper1) = bootstrap_ci(&samples, &config);
        let (lower2, upper2) = bootstrap_ci(&samples, &config);
        assert_eq!(lower1, lower2);
        assert_eq!(upper1, upper2);

        let mean = compute_mean(&samples);
        assert!(lower1 <= mean && mean <= upper1);
    }

    #[test]
    fn test_bootstrap_ci_single_sample() {
        let (lower, upper) = bootstrap_ci(&[0.95], &StatConfig::default());
        assert_eq!(lower, 0.95);
        assert_eq!(upper, 0.95);
    }

    #[test]
    fn test_welch_t_test_separated_groups() {
        let ood: Vec<f64> = (0..50).map(|i| 2.0 + (i % 7) as f64 * 0.05).collect();
        let id: Vec<f64> = (0..50).map(|i| 0.3 + (i % 5) as f64 * 0.05).collect();
        let result = welch_t_test(&ood, &id, 0.05).unwrap();
        assert!(result.t_statistic > 0.0);
        assert!(result.is_significant);
        assert_eq!(result.effect_interpretation, "large");
    }

    #[test]
    fn test_welch_t_test_degenerate() {
        assert!(welch_t_test(&[1.0], &[2.0, 3.0], 0.05).is_none());
        assert!(welch_t_test(&[1.0, 1.0], &[2.0, 2.0], 0.05).is_none());
    }

    #[test]
    fn test_interpret_cohens_d() {
        assert_eq!(interpret_cohens_d(0.1), "negligible");
        assert_eq!(interpret_cohens_d(-0.3), "small");
        assert_eq!(interpret_cohens_d(0.6), "medium");
        assert_eq!(interpret_cohens_d(1.2), "large");
    }

    // =========================================================================
    // Curve tests
    // =========================================================================

    #[test]
    fn test_auroc_all_tied_is_half() {
        let data = labeled(&[0.7; 20], &[0.7; 13]);
        assert!((auroc(&data).unwrap() - 0.5).abs() < 1e-12);
        let roc = roc_curve(&data).unwrap();
        assert_eq!(roc.len(), 2);
        assert_eq!((roc[1].fpr, roc[1].tpr), (1.0, 1.0));
    }

    #[test]
    fn test_auroc_perfect_separation() {
        let data = labeled(&[0.1, 0.2, 0.3], &[0.8, 0.9]);
        assert!((auroc(&data).unwrap() - 1.0).abs() < 1e-12);
        assert!((aupr(&data).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_auroc_inverted() {
        let data = labeled(&[0.8, 0.9], &[0.1, 0.2]);
        assert!(auroc(&data).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_auroc_partial_ties() {
        let id = [0.1, 0.5, 0.5, 0.9];
        let ood = [0.5, 0.7, 0.95];
        let expected = pairwise_auroc(&id, &ood);
        assert!((auroc(&labeled(&id, &ood)).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_pr_curve_interpolation() {
        // descending: 0.9 OOD, 0.8 ID, 0.7 OOD
        let data = labeled(&[0.8], &[0.9, 0.7]);
        let pr = pr_curve(&data).unwrap();
        assert_eq!(pr.len(), 4);
        assert_eq!(pr[0].threshold, None);
        assert_eq!((pr[1].recall, pr[1].precision), (0.5, 1.0));
        assert_eq!((pr[2].recall, pr[2].precision), (0.5, 0.5));
        // recall 1.0 reached at precision 2/3, which dominates the dip
        assert!((pr[3].precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((pr[2].interpolated_precision - 2.0 / 3.0).abs() < 1e-12);
        for pair in pr.windows(2) {
            assert!(pair[0].interpolated_precision >= pair[1].interpolated_precision);
        }

        let area = aupr(&data).unwrap();
        let expected = 0.5 * (1.0 + 1.0) / 2.0 + 0.5 * (2.0 / 3.0 + 2.0 / 3.0) / 2.0;
        assert!((area - expected).abs() < 1e-12);
    }

    #[test]
    fn test_curves_need_both_groups() {
        assert_eq!(
            auroc(&labeled(&[], &[0.5])),
            Err(MetricsError::EmptyGroup(CorpusLabel::Id))
        );
        assert_eq!(
            aupr(&labeled(&[0.5], &[])),
            Err(MetricsError::EmptyGroup(CorpusLabel::Ood))
        );
    }

    #[test]
    fn test_non_finite_rejected() {
        let result = auroc(&labeled(&[f64::NAN], &[0.5]));
        assert!(matches!(result, Err(MetricsError::NonFiniteScore(_))));
    }

    #[test]
    fn test_trapezoid() {
        assert_eq!(trapezoid([(0.0, 0.0), (1.0, 1.0)]), 0.5);
        assert_eq!(trapezoid(std::iter::empty::<(f64, f64)>()), 0.0);
    }

    // =========================================================================
    // Histogram tests
    // =========================================================================

    #[test]
    fn test_histogram_counts() {
        let data = labeled(&[0.0, 0.1, 0.2], &[0.9, 1.0]);
        let hist = Histogram::new(&data, 10, 0.6);
        assert_eq!(hist.bins(), 10);
        assert_eq!(hist.edges.len(), 11);
        assert_eq!(hist.id_counts.iter().sum::<usize>(), 3);
        assert_eq!(hist.ood_counts.iter().sum::<usize>(), 2);
        // max lands in the last bin
        assert_eq!(hist.ood_counts[9], 2);
        assert_eq!(hist.id_counts[0], 1);
    }

    #[test]
    fn test_histogram_constant_scores() {
        let hist = Histogram::new(&labeled(&[0.4, 0.4], &[0.4]), 5, 0.6);
        assert_eq!(hist.id_counts[0], 2);
        assert_eq!(hist.ood_counts[0], 1);
    }

    // =========================================================================
    // RunMetrics tests
    // =========================================================================

    fn ledger(id: &[f64], ood: &[f64], threshold: f64) -> ClosedLedger {
        let mut ledger = Ledger::new(ScoreMethod::Entropy);
        let groups = [(CorpusLabel::Id, id), (CorpusLabel::Ood, ood)];
        for (label, scores) in groups {
            for (i, &score) in scores.iter().enumerate() {
                let decision = if score > threshold {
                    Decision::Ood
                } else {
                    Decision::Id
                };
                ledger
                    .append(EvaluationRecord {
                        key: format!("{label}_{i}.png"),
                        label,
                        score,
                        decision,
                        predicted_class: None,
                        path: PathBuf::from(format!("/data/{label}_{i}.png")),
                    })
                    .unwrap();
            }
        }
        ledger.close().unwrap()
    }

    #[test]
    fn test_run_metrics_compute() {
        let closed = ledger(&[0.1, 0.2, 0.7], &[0.8, 1.5], 0.6);
        let metrics = RunMetrics::compute(&closed, 0.6, &OodConfig::default()).unwrap();

        assert_eq!(metrics.method, ScoreMethod::Entropy);
        assert_eq!(metrics.id.count, 3);
        assert_eq!(metrics.ood.count, 2);
        assert!((metrics.id.mean - (1.0 / 3.0)).abs() < 1e-12);
        assert!((metrics.ood.mean - 1.15).abs() < 1e-12);
        assert_eq!(metrics.id.flagged_ood, 1);
        assert!((metrics.accuracy - 0.8).abs() < 1e-12);
        assert!((metrics.auroc - 1.0).abs() < 1e-12);
        assert_eq!(metrics.histogram.bins(), 50);

        let json = metrics.to_json().unwrap();
        let back: RunMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.roc.len(), metrics.roc.len());
    }

    #[test]
    fn test_run_metrics_empty_group() {
        let closed = ledger(&[0.1], &[], 0.6);
        let result = RunMetrics::compute(&closed, 0.6, &OodConfig::default());
        assert_eq!(result, Err(MetricsError::EmptyGroup(CorpusLabel::Ood)));
    }

    proptest! {
        #[test]
        fn prop_auroc_matches_pairwise(
            id in prop::collection::vec(0_u8..10, 1..20),
            ood in prop::collection::vec(0_u8..10, 1..20),
        ) {
            let id: Vec<f64> = id.into_iter().map(f64::from).collect();
            let ood: Vec<f64> = ood.into_iter().map(f64::from).collect();
            let area = auroc(&labeled(&id, &ood)).unwrap();
            prop_assert!((area - pairwise_auroc(&id, &ood)).abs() < 1e-9);
        }

        #[test]
        fn prop_aupr_bounded(
            id in prop::collection::vec(0.0_f64..5.0, 1..20),
            ood in prop::collection::vec(0.0_f64..5.0, 1..20),
        ) {
            let area = aupr(&labeled(&id, &ood)).unwrap();
            prop_assert!((0.0..=1.0 + 1e-12).contains(&area));
        }
    }
}
