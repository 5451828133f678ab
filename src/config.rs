//! Configuration for scoring and evaluation runs.
//!
//! Handles YAML loading of [`OodConfig`] with validation of the recognized
//! options. Every component receives the config explicitly at construction;
//! nothing here is global.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Unknown scoring method: {0}")]
    InvalidMethod(String),
}

/// Scoring and evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OodConfig {
    /// Stochastic forward passes per sample
    #[serde(default = "default_mc_samples")]
    pub mc_samples: usize,
    /// Decision threshold for predictive entropy
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,
    /// Decision threshold for the latent-variance weighted ELBO score
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    /// Decision threshold for the pixel-space variance score
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: f64,
    /// Weight applied to the epistemic (latent variance) term
    #[serde(default = "default_alpha_weight")]
    pub alpha_weight: f64,
    /// Class names, indexed by classifier output position
    #[serde(default = "default_class_names")]
    pub class_names: Vec<String>,
    /// Seed for the stochastic passes and bootstrap resampling
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Copy inputs into `sorted_images/Predicted_{ID,OOD}` under the run directory
    #[serde(default)]
    pub sort_images: bool,
    /// Bins of the score histogram
    #[serde(default = "default_histogram_bins")]
    pub histogram_bins: usize,
    /// Bootstrap resamples for group-mean confidence intervals
    #[serde(default = "default_bootstrap_n")]
    pub bootstrap_n: usize,
    /// Confidence level of the bootstrap intervals
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

const fn default_mc_samples() -> usize {
    30
}
const fn default_entropy_threshold() -> f64 {
    0.6
}
const fn default_anomaly_threshold() -> f64 {
    500.0
}
const fn default_pixel_threshold() -> f64 {
    0.02
}
const fn default_alpha_weight() -> f64 {
    100.0
}
const fn default_seed() -> u64 {
    42
}
const fn default_histogram_bins() -> usize {
    50
}
const fn default_bootstrap_n() -> usize {
    1000
}
const fn default_confidence() -> f64 {
    0.95
}

fn default_class_names() -> Vec<String> {
    [
        "butterfly",
        "cat",
        "chicken",
        "cow",
        "dog",
        "elephant",
        "horse",
        "sheep",
        "spider",
        "squirrel",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl Default for OodConfig {
    fn default() -> Self {
        Self {
            mc_samples: default_mc_samples(),
            entropy_threshold: default_entropy_threshold(),
            anomaly_threshold: default_anomaly_threshold(),
            pixel_threshold: default_pixel_threshold(),
            alpha_weight: default_alpha_weight(),
            class_names: default_class_names(),
            seed: default_seed(),
            sort_images: false,
            histogram_bins: default_histogram_bins(),
            bootstrap_n: default_bootstrap_n(),
            confidence: default_confidence(),
        }
    }
}

impl OodConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed or fails validation.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as YAML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the recognized options are in range
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mc_samples == 0 {
            return Err(invalid("mc_samples", "must be greater than zero"));
        }
        if !self.alpha_weight.is_finite() || self.alpha_weight < 0.0 {
            return Err(invalid("alpha_weight", "must be finite and >= 0"));
        }
        for (field, value) in [
            ("entropy_threshold", self.entropy_threshold),
            ("anomaly_threshold", self.anomaly_threshold),
            ("pixel_threshold", self.pixel_threshold),
        ] {
            if !value.is_finite() {
                return Err(invalid(field, "must be a finite number"));
            }
        }
        if self.histogram_bins == 0 {
            return Err(invalid("histogram_bins", "must be greater than zero"));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(invalid("confidence", "must lie strictly between 0 and 1"));
        }
        Ok(())
    }

    /// Name of a predicted class, falling back to its index
    #[must_use]
    pub fn class_name(&self, index: usize) -> String {
        self.class_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("class_{index}"))
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

/// Filesystem locations for one evaluation invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvalPaths {
    /// Serialized model weights
    pub model_path: PathBuf,
    /// In-distribution collection root
    pub id_dir: PathBuf,
    /// Out-of-distribution collection root
    pub ood_dir: PathBuf,
    /// Base directory under which `run_<i>` directories are allocated
    pub output_base: PathBuf,
}
