//! Anomaly scores for a variational autoencoder sampled with MC dropout.
//!
//! Two estimators live here and are deliberately kept apart, since they are
//! not numerically equivalent:
//!
//! - [`LatentElboScorer`]: expected negative ELBO plus `alpha` times the
//!   variance of the latent mean across passes (uncertainty in latent space).
//! - [`PixelVarianceScorer`]: MSE of the mean reconstruction plus the mean
//!   per-pixel variance of the reconstructions (uncertainty in output space).

use crate::config::OodConfig;
use crate::model::{ImageTensor, InferenceError, VaeOutput};
use crate::sampler::McBatch;
use serde::{Deserialize, Serialize};

/// Output of [`LatentElboScorer`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BayesianScore {
    /// Mean over passes of reconstruction loss + KL divergence
    pub expected_neg_elbo: f64,
    /// Sum over latent dimensions of the across-pass variance of the mean
    pub epistemic: f64,
    /// `expected_neg_elbo + alpha * epistemic`
    pub score: f64,
}

/// Latent-variance weighted negative-ELBO scorer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatentElboScorer {
    alpha: f64,
}

impl LatentElboScorer {
    #[must_use]
    pub const fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    #[must_use]
    pub fn from_config(config: &OodConfig) -> Self {
        Self::new(config.alpha_weight)
    }

    /// Weight of the epistemic term
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Score one input from its MC batch
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::ShapeMismatch` if a reconstruction does not
    /// match the input or latent vectors disagree in length.
    #[allow(clippy::cast_precision_loss)]
    pub fn score(
        &self,
        batch: &McBatch<VaeOutput>,
        input: &ImageTensor,
    ) -> Result<BayesianScore, InferenceError> {
        let latent = batch.as_slice()[0].mean.len();

        let mut elbo_total = 0.0;
        for output in batch {
            if output.mean.len() != latent || output.log_variance.len() != latent {
                return Err(InferenceError::ShapeMismatch {
                    context: "latent vector",
                    expected: latent,
                    actual: output.mean.len().max(output.log_variance.len()),
                });
            }
            let recon = reconstruction_loss(&output.reconstruction, input.as_slice())?;
            elbo_total += recon + kl_divergence(&output.mean, &output.log_variance);
        }
        let expected_neg_elbo = elbo_total / batch.len() as f64;

        let epistemic: f64 = (0..latent)
            .map(|d| sample_variance(batch.iter().map(|o| o.mean[d])))
            .sum();

        Ok(BayesianScore {
            expected_neg_elbo,
            epistemic,
            score: self.alpha.mul_add(epistemic, expected_neg_elbo),
        })
    }
}

impl Default for LatentElboScorer {
    fn default() -> Self {
        Self::new(100.0)
    }
}

/// Output of [`PixelVarianceScorer`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelScore {
    /// Mean squared error between the mean reconstruction and the input
    pub mse: f64,
    /// Per-pixel variance of the reconstructions, averaged over pixels
    pub pixel_variance: f64,
    /// `mse + pixel_variance`
    pub score: f64,
}

/// Output-space uncertainty scorer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PixelVarianceScorer;

impl PixelVarianceScorer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Score one input from its MC batch
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::ShapeMismatch` if a reconstruction does not
    /// match the input, or `InferenceFailed` for an empty input.
    #[allow(clippy::cast_precision_loss)]
    pub fn score(
        &self,
        batch: &McBatch<VaeOutput>,
        target: &ImageTensor,
    ) -> Result<PixelScore, InferenceError> {
        let pixels = target.len();
        if pixels == 0 {
            return Err(InferenceError::InferenceFailed(
                "empty target tensor".to_string(),
            ));
        }
        for output in batch {
            if output.reconstruction.len() != pixels {
                return Err(InferenceError::ShapeMismatch {
                    context: "reconstruction",
                    expected: pixels,
                    actual: output.reconstruction.len(),
                });
            }
        }

        let n = batch.len() as f64;
        let mut squared_error = 0.0;
        let mut variance = 0.0;
        for (p, &x) in target.as_slice().iter().enumerate() {
            let column = || batch.iter().map(move |o| o.reconstruction[p]);
            let mean = column().sum::<f64>() / n;
            squared_error += (mean - x).powi(2);
            variance += sample_variance(column());
        }

        let mse = squared_error / pixels as f64;
        let pixel_variance = variance / pixels as f64;
        Ok(PixelScore {
            mse,
            pixel_variance,
            score: mse + pixel_variance,
        })
    }
}

/// Sum of squared elementwise differences
///
/// # Errors
///
/// Returns `InferenceError::ShapeMismatch` if the lengths differ.
pub fn reconstruction_loss(reconstruction: &[f64], target: &[f64]) -> Result<f64, InferenceError> {
    if reconstruction.len() != target.len() {
        return Err(InferenceError::ShapeMismatch {
            context: "reconstruction",
            expected: target.len(),
            actual: reconstruction.len(),
        });
    }
    Ok(reconstruction
        .iter()
        .zip(target)
        .map(|(r, x)| (r - x).powi(2))
        .sum())
}

/// Closed-form `KL(N(μ, exp(ℓ)) || N(0, 1))` summed over dimensions
#[must_use]
pub fn kl_divergence(mean: &[f64], log_variance: &[f64]) -> f64 {
    let kl = -0.5
        * mean
            .iter()
            .zip(log_variance)
            .map(|(mu, lv)| 1.0 + lv - mu.powi(2) - lv.exp())
            .sum::<f64>();
    // non-negative analytically; clamp rounding noise
    kl.max(0.0)
}

/// Unbiased (n - 1) variance; zero for fewer than two values.
///
/// Shifted by the first value, so identical inputs give exactly zero.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn sample_variance(values: impl Iterator<Item = f64>) -> f64 {
    let mut shift = None;
    let mut n = 0_usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for value in values {
        let k = *shift.get_or_insert(value);
        let d = value - k;
        n += 1;
        sum += d;
        sum_sq += d * d;
    }
    if n < 2 {
        return 0.0;
    }
    let n = n as f64;
    ((sum_sq - sum * sum / n) / (n - 1.0)).max(0.0)
}
