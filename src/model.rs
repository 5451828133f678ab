//! Model inference interface and reference MC-dropout models.
//!
//! Scorers only ever see a model through [`StochasticModel`]: an explicit
//! switch for inference-time randomness plus a forward pass. The two reference
//! models load their parameters from JSON weight files and keep dropout (and,
//! for the VAE, reparameterization noise) active while stochastic mode is on.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during model loading or inference
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to load model: {0}")]
    LoadError(String),

    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Input is blank (zero-valued); nothing to score")]
    BlankInput,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A decoded input image in CHW layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTensor {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f64>,
}

impl ImageTensor {
    /// Create a tensor, checking that `data` matches the declared shape
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::ShapeMismatch` if the element count is wrong.
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f64>,
    ) -> Result<Self, InferenceError> {
        let tensor = Self {
            channels,
            height,
            width,
            data,
        };
        tensor.check_shape()?;
        Ok(tensor)
    }

    /// The empty sentinel yielded for inputs that failed to decode
    #[must_use]
    pub const fn blank() -> Self {
        Self {
            channels: 0,
            height: 0,
            width: 0,
            data: Vec::new(),
        }
    }

    /// Verify the element count against the declared shape
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::ShapeMismatch` if the element count is wrong.
    pub fn check_shape(&self) -> Result<(), InferenceError> {
        let expected = self.channels * self.height * self.width;
        if self.data.len() == expected {
            Ok(())
        } else {
            Err(InferenceError::ShapeMismatch {
                context: "image tensor",
                expected,
                actual: self.data.len(),
            })
        }
    }

    /// Zero-valued input is the documented skip signal
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.data.is_empty() || self.data.iter().all(|x| *x == 0.0)
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor holds no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat element view
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// A model whose forward pass can be made stochastic at inference time.
///
/// `forward` takes `&mut self` only so that implementations can advance a
/// private random number generator; parameters must never change.
pub trait StochasticModel {
    /// Raw per-pass output
    type Output;

    /// Force inference-time randomness on or off, independent of any
    /// train/eval distinction the model may have.
    fn set_stochastic_mode(&mut self, enabled: bool);

    /// Whether inference-time randomness is currently active
    fn is_stochastic(&self) -> bool;

    /// Run one forward pass
    ///
    /// # Errors
    ///
    /// Returns an error if the input does not fit the model.
    fn forward(&mut self, input: &ImageTensor) -> Result<Self::Output, InferenceError>;
}

/// Classifier logits for one forward pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutput {
    pub logits: Vec<f64>,
}

impl ClassifierOutput {
    /// Softmax of the logits
    #[must_use]
    pub fn probabilities(&self) -> Vec<f64> {
        softmax(&self.logits)
    }
}

/// Generative model output for one forward pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaeOutput {
    /// Reconstruction, same layout as the input
    pub reconstruction: Vec<f64>,
    /// Latent posterior mean
    pub mean: Vec<f64>,
    /// Latent posterior log-variance
    pub log_variance: Vec<f64>,
}

/// Numerically stable softmax
#[must_use]
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

const fn default_classifier_dropout() -> f64 {
    0.5
}

const fn default_vae_dropout() -> f64 {
    0.2
}

/// Parameters of [`McDropoutClassifier`], as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierWeights {
    /// Row-major `classes x features`
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    #[serde(default = "default_classifier_dropout")]
    pub dropout: f64,
}

/// Linear classification head with inverted dropout on its input features
#[derive(Debug)]
pub struct McDropoutClassifier {
    params: ClassifierWeights,
    features: usize,
    stochastic: bool,
    rng: ChaCha8Rng,
}

impl McDropoutClassifier {
    /// Build from in-memory weights
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::LoadError` for inconsistent shapes or an
    /// out-of-range dropout rate.
    pub fn from_weights(params: ClassifierWeights, seed: u64) -> Result<Self, InferenceError> {
        let features = params.weights.first().map_or(0, Vec::len);
        if params.weights.is_empty() || features == 0 {
            return Err(InferenceError::LoadError(
                "classifier weights are empty".to_string(),
            ));
        }
        check_matrix("classifier weights", &params.weights, features)?;
        if params.bias.len() != params.weights.len() {
            return Err(InferenceError::LoadError(format!(
                "classifier bias has {} entries for {} classes",
                params.bias.len(),
                params.weights.len()
            )));
        }
        check_dropout(params.dropout)?;
        Ok(Self {
            params,
            features,
            stochastic: false,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Load weights from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::LoadError` if the file is missing or malformed.
    pub fn load(path: impl AsRef<Path>, seed: u64) -> Result<Self, InferenceError> {
        let params: ClassifierWeights = read_weights(path.as_ref())?;
        Self::from_weights(params, seed)
    }

    /// Number of output classes
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.params.weights.len()
    }

    /// Expected flattened input length
    #[must_use]
    pub const fn num_features(&self) -> usize {
        self.features
    }
}

impl StochasticModel for McDropoutClassifier {
    type Output = ClassifierOutput;

    fn set_stochastic_mode(&mut self, enabled: bool) {
        self.stochastic = enabled;
    }

    fn is_stochastic(&self) -> bool {
        self.stochastic
    }

    fn forward(&mut self, input: &ImageTensor) -> Result<ClassifierOutput, InferenceError> {
        check_input("classifier input", input, self.features)?;
        let hidden = if self.stochastic {
            dropout(input.as_slice(), self.params.dropout, &mut self.rng)
        } else {
            input.data.clone()
        };
        Ok(ClassifierOutput {
            logits: linear(&self.params.weights, &self.params.bias, &hidden),
        })
    }
}

/// Parameters of [`McDropoutVae`], as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaeWeights {
    /// `latent x features`
    pub encoder_mean: Vec<Vec<f64>>,
    pub encoder_mean_bias: Vec<f64>,
    /// `latent x features`
    pub encoder_log_variance: Vec<Vec<f64>>,
    pub encoder_log_variance_bias: Vec<f64>,
    /// `features x latent`
    pub decoder: Vec<Vec<f64>>,
    pub decoder_bias: Vec<f64>,
    #[serde(default = "default_vae_dropout")]
    pub dropout: f64,
}

/// Linear variational autoencoder with dropout before the latent heads
#[derive(Debug)]
pub struct McDropoutVae {
    params: VaeWeights,
    features: usize,
    latent: usize,
    stochastic: bool,
    rng: ChaCha8Rng,
    noise: Normal,
}

impl McDropoutVae {
    /// Build from in-memory weights
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::LoadError` for inconsistent shapes or an
    /// out-of-range dropout rate.
    pub fn from_weights(params: VaeWeights, seed: u64) -> Result<Self, InferenceError> {
        let latent = params.encoder_mean.len();
        let features = params.encoder_mean.first().map_or(0, Vec::len);
        if latent == 0 || features == 0 {
            return Err(InferenceError::LoadError(
                "encoder weights are empty".to_string(),
            ));
        }
        check_matrix("encoder mean", &params.encoder_mean, features)?;
        check_matrix("encoder log-variance", &params.encoder_log_variance, features)?;
        check_matrix("decoder", &params.decoder, latent)?;
        for (name, actual, expected) in [
            ("encoder mean bias", params.encoder_mean_bias.len(), latent),
            (
                "encoder log-variance rows",
                params.encoder_log_variance.len(),
                latent,
            ),
            (
                "encoder log-variance bias",
                params.encoder_log_variance_bias.len(),
                latent,
            ),
            ("decoder rows", params.decoder.len(), features),
            ("decoder bias", params.decoder_bias.len(), features),
        ] {
            if actual != expected {
                return Err(InferenceError::LoadError(format!(
                    "{name} has {actual} entries, expected {expected}"
                )));
            }
        }
        check_dropout(params.dropout)?;
        let noise = Normal::new(0.0, 1.0)
            .map_err(|e| InferenceError::LoadError(format!("noise distribution: {e}")))?;
        Ok(Self {
            params,
            features,
            latent,
            stochastic: false,
            rng: ChaCha8Rng::seed_from_u64(seed),
            noise,
        })
    }

    /// Load weights from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::LoadError` if the file is missing or malformed.
    pub fn load(path: impl AsRef<Path>, seed: u64) -> Result<Self, InferenceError> {
        let params: VaeWeights = read_weights(path.as_ref())?;
        Self::from_weights(params, seed)
    }

    /// Latent dimensionality
    #[must_use]
    pub const fn latent_dim(&self) -> usize {
        self.latent
    }

    /// Expected flattened input length
    #[must_use]
    pub const fn num_features(&self) -> usize {
        self.features
    }
}

impl StochasticModel for McDropoutVae {
    type Output = VaeOutput;

    fn set_stochastic_mode(&mut self, enabled: bool) {
        self.stochastic = enabled;
    }

    fn is_stochastic(&self) -> bool {
        self.stochastic
    }

    fn forward(&mut self, input: &ImageTensor) -> Result<VaeOutput, InferenceError> {
        use rand::distributions::Distribution;

        check_input("vae input", input, self.features)?;
        let hidden = if self.stochastic {
            dropout(input.as_slice(), self.params.dropout, &mut self.rng)
        } else {
            input.data.clone()
        };

        let mean = linear(
            &self.params.encoder_mean,
            &self.params.encoder_mean_bias,
            &hidden,
        );
        let log_variance = linear(
            &self.params.encoder_log_variance,
            &self.params.encoder_log_variance_bias,
            &hidden,
        );

        let z: Vec<f64> = if self.stochastic {
            mean.iter()
                .zip(&log_variance)
                .map(|(mu, lv)| mu + self.noise.sample(&mut self.rng) * (0.5 * lv).exp())
                .collect()
        } else {
            mean.clone()
        };

        let reconstruction = linear(&self.params.decoder, &self.params.decoder_bias, &z)
            .into_iter()
            .map(sigmoid)
            .collect();

        Ok(VaeOutput {
            reconstruction,
            mean,
            log_variance,
        })
    }
}

fn read_weights<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, InferenceError> {
    if !path.exists() {
        return Err(InferenceError::LoadError(format!(
            "model weights not found at {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        InferenceError::LoadError(format!("malformed weights in {}: {e}", path.display()))
    })
}

fn check_matrix(name: &str, matrix: &[Vec<f64>], cols: usize) -> Result<(), InferenceError> {
    match matrix.iter().position(|row| row.len() != cols) {
        Some(row) => Err(InferenceError::LoadError(format!(
            "{name} row {row} has {} columns, expected {cols}",
            matrix[row].len()
        ))),
        None => Ok(()),
    }
}

fn check_dropout(p: f64) -> Result<(), InferenceError> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(InferenceError::LoadError(format!(
            "dropout rate {p} outside [0, 1)"
        )))
    }
}

fn check_input(
    context: &'static str,
    input: &ImageTensor,
    features: usize,
) -> Result<(), InferenceError> {
    if input.len() == features {
        Ok(())
    } else {
        Err(InferenceError::ShapeMismatch {
            context,
            expected: features,
            actual: input.len(),
        })
    }
}

/// Inverted dropout: kept units are rescaled by `1 / (1 - p)`
fn dropout(input: &[f64], p: f64, rng: &mut ChaCha8Rng) -> Vec<f64> {
    if p <= 0.0 {
        return input.to_vec();
    }
    let scale = 1.0 / (1.0 - p);
    input
        .iter()
        .map(|x| if rng.gen::<f64>() < p { 0.0 } else { x * scale })
        .collect()
}

fn linear(weights: &[Vec<f64>], bias: &[f64], input: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .zip(bias)
        .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + b)
        .collect()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn classifier_weights() -> ClassifierWeights {
        ClassifierWeights {
            weights: vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]],
            bias: vec![0.0, 0.5],
            dropout: 0.5,
        }
    }

    fn vae_weights() -> VaeWeights {
        VaeWeights {
            encoder_mean: vec![vec![0.5, 0.5, 0.0, 0.0]],
            encoder_mean_bias: vec![0.0],
            encoder_log_variance: vec![vec![0.0; 4]],
            encoder_log_variance_bias: vec![-2.0],
            decoder: vec![vec![1.0], vec![1.0], vec![-1.0], vec![-1.0]],
            decoder_bias: vec![0.0; 4],
            dropout: 0.2,
        }
    }

    fn input() -> ImageTensor {
        ImageTensor::new(1, 2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap()
    }

    #[test]
    fn test_image_tensor_shape_checked() {
        let result = ImageTensor::new(3, 2, 2, vec![0.0; 5]);
        assert!(matches!(
            result,
            Err(InferenceError::ShapeMismatch { expected: 12, actual: 5, .. })
        ));
    }

    #[test]
    fn test_blank_detection() {
        assert!(ImageTensor::blank().is_blank());
        assert!(ImageTensor::new(1, 1, 2, vec![0.0, 0.0]).unwrap().is_blank());
        assert!(!input().is_blank());
    }

    #[test]
    fn test_signed_input_summing_to_zero_is_not_blank() {
        let normalized = ImageTensor::new(1, 1, 2, vec![0.5, -0.5]).unwrap();
        assert!(!normalized.is_blank());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_softmax_large_logits_stable() {
        let p = softmax(&[1000.0, 1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_classifier_deterministic_mode() {
        let mut model = McDropoutClassifier::from_weights(classifier_weights(), 1).unwrap();
        assert!(!model.is_stochastic());
        let a = model.forward(&input()).unwrap();
        let b = model.forward(&input()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.logits, vec![1.0, 2.5]);
    }

    #[test]
    fn test_classifier_stochastic_mode_varies() {
        let mut model = McDropoutClassifier::from_weights(classifier_weights(), 1).unwrap();
        model.set_stochastic_mode(true);
        let outputs: Vec<_> = (0..20).map(|_| model.forward(&input()).unwrap()).collect();
        assert!(outputs.iter().any(|o| o != &outputs[0]));
    }

    #[test]
    fn test_classifier_same_seed_reproducible() {
        let mut a = McDropoutClassifier::from_weights(classifier_weights(), 9).unwrap();
        let mut b = McDropoutClassifier::from_weights(classifier_weights(), 9).unwrap();
        a.set_stochastic_mode(true);
        b.set_stochastic_mode(true);
        for _ in 0..5 {
            assert_eq!(a.forward(&input()).unwrap(), b.forward(&input()).unwrap());
        }
    }

    #[test]
    fn test_classifier_rejects_wrong_input() {
        let mut model = McDropoutClassifier::from_weights(classifier_weights(), 1).unwrap();
        let wrong = ImageTensor::new(1, 1, 3, vec![1.0; 3]).unwrap();
        assert!(matches!(
            model.forward(&wrong),
            Err(InferenceError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_classifier_rejects_ragged_weights() {
        let mut weights = classifier_weights();
        weights.weights[1].pop();
        assert!(McDropoutClassifier::from_weights(weights, 0).is_err());
    }

    #[test]
    fn test_classifier_rejects_bad_dropout() {
        let mut weights = classifier_weights();
        weights.dropout = 1.0;
        assert!(McDropoutClassifier::from_weights(weights, 0).is_err());
    }

    #[test]
    fn test_classifier_load_missing_file() {
        let result = McDropoutClassifier::load("/nonexistent/weights.json", 0);
        assert!(matches!(result, Err(InferenceError::LoadError(_))));
    }

    #[test]
    fn test_classifier_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clf.json");
        std::fs::write(&path, serde_json::to_string(&classifier_weights()).unwrap()).unwrap();
        let model = McDropoutClassifier::load(&path, 0).unwrap();
        assert_eq!(model.num_classes(), 2);
        assert_eq!(model.num_features(), 4);
    }

    #[test]
    fn test_classifier_load_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clf.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = McDropoutClassifier::load(&path, 0).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_vae_deterministic_uses_mean() {
        let mut model = McDropoutVae::from_weights(vae_weights(), 3).unwrap();
        let out = model.forward(&input()).unwrap();
        assert_eq!(out.mean, vec![1.5]);
        assert_eq!(out.log_variance, vec![-2.0]);
        assert_eq!(out.reconstruction.len(), 4);
        assert!(out.reconstruction.iter().all(|r| (0.0..=1.0).contains(r)));
        assert_eq!(model.latent_dim(), 1);
    }

    #[test]
    fn test_vae_stochastic_mode_varies() {
        let mut model = McDropoutVae::from_weights(vae_weights(), 3).unwrap();
        model.set_stochastic_mode(true);
        let a = model.forward(&input()).unwrap();
        let b = model.forward(&input()).unwrap();
        assert_ne!(a.reconstruction, b.reconstruction);
    }

    #[test]
    fn test_vae_rejects_mismatched_decoder() {
        let mut weights = vae_weights();
        weights.decoder.pop();
        let err = McDropoutVae::from_weights(weights, 0).unwrap_err();
        assert!(err.to_string().contains("decoder rows"));
    }

    #[test]
    fn test_inference_error_display() {
        let err = InferenceError::LoadError("missing".to_string());
        assert!(err.to_string().contains("missing"));
        assert!(InferenceError::BlankInput.to_string().contains("blank"));
    }
}
