//! Predictive-entropy scoring for MC-dropout classifiers.
//!
//! The per-pass class distributions are averaged entrywise and the Shannon
//! entropy of the mean distribution is the anomaly score. The mean of
//! distributions is itself a distribution, so no renormalization happens.

use crate::model::{ClassifierOutput, InferenceError};
use crate::sampler::McBatch;
use serde::{Deserialize, Serialize};

/// Guards `ln(0)`; not a smoothing term
pub const ENTROPY_EPSILON: f64 = 1e-12;

/// Reduced output of the entropy scorer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntropyScore {
    /// Argmax of the mean distribution, lowest index on ties
    pub predicted_class: usize,
    /// Mean probability of the predicted class
    pub confidence: f64,
    /// Entropy of the mean distribution (nats)
    pub entropy: f64,
}

/// Reduces an MC batch of class distributions to an entropy score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntropyScorer;

impl EntropyScorer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Score a batch of probability vectors
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::ShapeMismatch` if the vectors differ in length,
    /// or `InferenceError::InferenceFailed` if they are empty.
    pub fn score_probabilities(
        &self,
        batch: &McBatch<Vec<f64>>,
    ) -> Result<EntropyScore, InferenceError> {
        let mean = mean_distribution(batch.as_slice())?;
        Ok(summarize(&mean))
    }

    /// Score a batch of classifier logits (softmax applied per pass)
    ///
    /// # Errors
    ///
    /// Same as [`EntropyScorer::score_probabilities`].
    pub fn score_logits(
        &self,
        batch: &McBatch<ClassifierOutput>,
    ) -> Result<EntropyScore, InferenceError> {
        let probabilities: Vec<Vec<f64>> =
            batch.iter().map(ClassifierOutput::probabilities).collect();
        let mean = mean_distribution(&probabilities)?;
        Ok(summarize(&mean))
    }
}

/// Entrywise arithmetic mean of equally sized distributions
///
/// # Errors
///
/// Returns an error if `samples` is empty, the vectors are empty, or their
/// lengths disagree.
#[allow(clippy::cast_precision_loss)]
pub fn mean_distribution(samples: &[Vec<f64>]) -> Result<Vec<f64>, InferenceError> {
    let classes = samples.first().map_or(0, Vec::len);
    if classes == 0 {
        return Err(InferenceError::InferenceFailed(
            "empty class distribution".to_string(),
        ));
    }

    let mut mean = vec![0.0; classes];
    for sample in samples {
        if sample.len() != classes {
            return Err(InferenceError::ShapeMismatch {
                context: "class distribution",
                expected: classes,
                actual: sample.len(),
            });
        }
        for (acc, p) in mean.iter_mut().zip(sample) {
            *acc += p;
        }
    }

    let n = samples.len() as f64;
    for value in &mut mean {
        *value /= n;
    }
    Ok(mean)
}

/// `-Σ p·ln(p + ε)`, floored at zero
#[must_use]
pub fn shannon_entropy(distribution: &[f64]) -> f64 {
    let h: f64 = -distribution
        .iter()
        .map(|p| p * (p + ENTROPY_EPSILON).ln())
        .sum::<f64>();
    // ε makes a certain distribution come out at -1e-12
    h.max(0.0)
}

/// Index and value of the largest entry; first index wins ties
#[must_use]
pub fn argmax(values: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (index, &value) in values.iter().enumerate() {
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((index, value)),
        }
    }
    best
}

fn summarize(mean: &[f64]) -> EntropyScore {
    let (predicted_class, confidence) = argmax(mean).unwrap_or((0, 0.0));
    EntropyScore {
        predicted_class,
        confidence,
        entropy: shannon_entropy(mean),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn batch(samples: Vec<Vec<f64>>) -> McBatch<Vec<f64>> {
        McBatch::from_outputs(samples).unwrap()
    }

    #[test]
    fn test_uniform_distribution_is_ln_c() {
        for classes in [2_usize, 3, 10, 100] {
            let p = vec![1.0 / classes as f64; classes];
            let score = EntropyScorer::new()
                .score_probabilities(&batch(vec![p; 5]))
                .unwrap();
            assert!(
                (score.entropy - (classes as f64).ln()).abs() < 1e-9,
                "C={classes}: {}",
                score.entropy
            );
        }
    }

    #[test]
    fn test_one_hot_is_zero() {
        let mut p = vec![0.0; 10];
        p[3] = 1.0;
        let score = EntropyScorer::new()
            .score_probabilities(&batch(vec![p; 30]))
            .unwrap();
        assert!(score.entropy.abs() < 1e-9);
        assert_eq!(score.predicted_class, 3);
        assert!((score.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_never_anomalous() {
        let score = EntropyScorer::new()
            .score_probabilities(&batch(vec![vec![1.0]; 4]))
            .unwrap();
        assert_eq!(score.entropy, 0.0);
        assert_eq!(score.predicted_class, 0);
    }

    #[test]
    fn test_single_sample_batch() {
        let score = EntropyScorer::new()
            .score_probabilities(&batch(vec![vec![0.5, 0.5]]))
            .unwrap();
        assert!((score.entropy - 2.0_f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_confident_animal_scenario() {
        let mut p = vec![0.01; 10];
        p[0] = 0.91;
        let score = EntropyScorer::new()
            .score_probabilities(&batch(vec![p; 30]))
            .unwrap();
        assert!(score.entropy < 0.6, "entropy = {}", score.entropy);
        assert_eq!(score.predicted_class, 0);
        assert!((score.confidence - 0.91).abs() < 1e-12);
    }

    #[test]
    fn test_disagreeing_samples_raise_entropy() {
        // Each pass is confident, but about a different class
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let score = EntropyScorer::new()
            .score_probabilities(&batch(vec![a, b]))
            .unwrap();
        assert!((score.entropy - 2.0_f64.ln()).abs() < 1e-9);
        // Tie goes to the lowest index
        assert_eq!(score.predicted_class, 0);
    }

    #[test]
    fn test_score_logits_applies_softmax() {
        let outputs = vec![
            ClassifierOutput {
                logits: vec![0.0, 0.0, 0.0],
            };
            3
        ];
        let score = EntropyScorer::new()
            .score_logits(&McBatch::from_outputs(outputs).unwrap())
            .unwrap();
        assert!((score.entropy - 3.0_f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let result = EntropyScorer::new()
            .score_probabilities(&batch(vec![vec![0.5, 0.5], vec![1.0]]));
        assert!(matches!(result, Err(InferenceError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_empty_distribution_rejected() {
        let result = EntropyScorer::new().score_probabilities(&batch(vec![Vec::new()]));
        assert!(result.is_err());
    }

    #[test]
    fn test_argmax_ties() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some((1, 0.4)));
        assert_eq!(argmax(&[]), None);
    }

    fn distribution(classes: usize) -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(0.001_f64..1.0, classes).prop_map(|raw| {
            let total: f64 = raw.iter().sum();
            raw.into_iter().map(|x| x / total).collect()
        })
    }

    proptest! {
        #[test]
        fn prop_order_independent(
            (samples, shuffled) in (2_usize..8)
                .prop_flat_map(|c| prop::collection::vec(distribution(c), 1..12))
                .prop_flat_map(|s| (Just(s.clone()), Just(s).prop_shuffle())),
        ) {
            let scorer = EntropyScorer::new();
            let a = scorer.score_probabilities(&batch(samples)).unwrap();
            let b = scorer.score_probabilities(&batch(shuffled)).unwrap();
            prop_assert!((a.entropy - b.entropy).abs() < 1e-9);
            prop_assert!((a.confidence - b.confidence).abs() < 1e-9);
        }

        #[test]
        fn prop_entropy_bounded(
            samples in (1_usize..12).prop_flat_map(|c| prop::collection::vec(distribution(c), 1..6)),
        ) {
            let classes = samples[0].len() as f64;
            let score = EntropyScorer::new().score_probabilities(&batch(samples)).unwrap();
            prop_assert!(score.entropy >= 0.0);
            prop_assert!(score.entropy <= classes.ln() + 1e-9);
            prop_assert!((0.0..=1.0 + 1e-12).contains(&score.confidence));
        }
    }
}
