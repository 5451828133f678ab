//! Threshold decision rule and the scoring-method catalogue.

use crate::config::{ConfigError, OodConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which estimator produced a score. Scores from different methods live on
/// different scales and are never compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    /// Predictive entropy of an MC-dropout classifier
    Entropy,
    /// Expected negative ELBO plus weighted latent-mean variance
    LatentElbo,
    /// Reconstruction MSE plus pixel-space variance
    PixelVariance,
}

impl ScoreMethod {
    /// Stable short name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Entropy => "entropy",
            Self::LatentElbo => "latent_elbo",
            Self::PixelVariance => "pixel_variance",
        }
    }

    /// Whether the method needs a classifier (otherwise a VAE)
    #[must_use]
    pub const fn uses_classifier(self) -> bool {
        matches!(self, Self::Entropy)
    }

    /// The configured threshold for this method
    #[must_use]
    pub const fn threshold(self, config: &OodConfig) -> f64 {
        match self {
            Self::Entropy => config.entropy_threshold,
            Self::LatentElbo => config.anomaly_threshold,
            Self::PixelVariance => config.pixel_threshold,
        }
    }
}

impl fmt::Display for ScoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ScoreMethod {
    type Err = ConfigError;

    /// Parse a method name
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMethod` for unknown names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "entropy" | "classifier" => Ok(Self::Entropy),
            "latent_elbo" | "latent-elbo" | "vae" | "bayesian" => Ok(Self::LatentElbo),
            "pixel_variance" | "pixel-variance" | "pixel" => Ok(Self::PixelVariance),
            _ => Err(ConfigError::InvalidMethod(s.to_string())),
        }
    }
}

/// Binary in/out-of-distribution label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "ID")]
    Id,
    #[serde(rename = "OOD")]
    Ood,
}

impl Decision {
    #[must_use]
    pub const fn is_ood(self) -> bool {
        matches!(self, Self::Ood)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Ood => "OOD",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-threshold decision rule: OOD iff `score > threshold`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decider {
    threshold: f64,
}

impl Decider {
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Decider using the threshold configured for `method`
    #[must_use]
    pub const fn for_method(config: &OodConfig, method: ScoreMethod) -> Self {
        Self::new(method.threshold(config))
    }

    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    #[must_use]
    pub fn decide(&self, score: f64) -> Decision {
        if score > self.threshold {
            Decision::Ood
        } else {
            Decision::Id
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    #[test]
    fn test_strict_inequality() {
        let decider = Decider::new(0.6);
        assert_eq!(decider.decide(0.6), Decision::Id);
        assert_eq!(decider.decide(0.600_000_1), Decision::Ood);
        assert_eq!(decider.decide(0.0), Decision::Id);
    }

    #[test]
    fn test_thresholds_are_per_method() {
        let config = OodConfig::default();
        let entropy = Decider::for_method(&config, ScoreMethod::Entropy);
        let latent = Decider::for_method(&config, ScoreMethod::LatentElbo);
        let pixel = Decider::for_method(&config, ScoreMethod::PixelVariance);
        assert!((entropy.threshold() - config.entropy_threshold).abs() < f64::EPSILON);
        assert!((latent.threshold() - config.anomaly_threshold).abs() < f64::EPSILON);
        assert!((pixel.threshold() - config.pixel_threshold).abs() < f64::EPSILON);
        // a score that is anomalous on the entropy scale is not on the ELBO scale
        assert_eq!(entropy.decide(2.0), Decision::Ood);
        assert_eq!(latent.decide(2.0), Decision::Id);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(ScoreMethod::from_str("entropy").unwrap(), ScoreMethod::Entropy);
        assert_eq!(ScoreMethod::from_str("VAE").unwrap(), ScoreMethod::LatentElbo);
        assert_eq!(
            ScoreMethod::from_str("pixel").unwrap(),
            ScoreMethod::PixelVariance
        );
        assert!(matches!(
            ScoreMethod::from_str("mahalanobis"),
            Err(ConfigError::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Decision::Ood.to_string(), "OOD");
        assert_eq!(Decision::Id.to_string(), "ID");
        assert_eq!(ScoreMethod::LatentElbo.to_string(), "latent_elbo");
        assert!(ScoreMethod::Entropy.uses_classifier());
        assert!(!ScoreMethod::PixelVariance.uses_classifier());
    }

    proptest! {
        #[test]
        fn prop_monotonic(threshold in -10.0_f64..10.0, a in -20.0_f64..20.0, delta in 0.0_f64..20.0) {
            let decider = Decider::new(threshold);
            let before = decider.decide(a);
            let after = decider.decide(a + delta);
            prop_assert!(!(before == Decision::Ood && after == Decision::Id));
        }
    }
}
