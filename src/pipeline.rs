//! Per-sample scoring pipelines.
//!
//! A pipeline owns a model and binds it to the sampler, one reducer and the
//! decider configured for that reducer's method. The runner and the detect
//! entry point only see the [`SampleScorer`] trait.

use crate::bayesian::{LatentElboScorer, PixelVarianceScorer};
use crate::config::{ConfigError, OodConfig};
use crate::decision::{Decider, Decision, ScoreMethod};
use crate::entropy::EntropyScorer;
use crate::model::{ClassifierOutput, ImageTensor, InferenceError, StochasticModel, VaeOutput};
use crate::sampler::StochasticSampler;
use serde::{Deserialize, Serialize};

/// Predicted class of a classifier-based assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPrediction {
    pub index: usize,
    pub name: String,
    pub confidence: f64,
}

/// Score and decision for one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub method: ScoreMethod,
    pub score: f64,
    pub decision: Decision,
    /// Only set for the entropy method
    pub predicted: Option<ClassPrediction>,
}

/// Scores one decoded input end to end
pub trait SampleScorer {
    /// Method whose scale the scores live on
    fn method(&self) -> ScoreMethod;

    /// Threshold used by the decision rule
    fn threshold(&self) -> f64;

    /// Sample, reduce and decide
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::BlankInput` for the blank sentinel, or any
    /// inference or shape failure from the model.
    fn assess(&mut self, input: &ImageTensor) -> Result<Assessment, InferenceError>;
}

impl<S: SampleScorer + ?Sized> SampleScorer for Box<S> {
    fn method(&self) -> ScoreMethod {
        (**self).method()
    }

    fn threshold(&self) -> f64 {
        (**self).threshold()
    }

    fn assess(&mut self, input: &ImageTensor) -> Result<Assessment, InferenceError> {
        (**self).assess(input)
    }
}

fn reject_blank(input: &ImageTensor) -> Result<(), InferenceError> {
    if input.is_blank() {
        Err(InferenceError::BlankInput)
    } else {
        Ok(())
    }
}

/// MC-dropout classifier scored by predictive entropy
#[derive(Debug)]
pub struct ClassifierPipeline<M> {
    model: M,
    sampler: StochasticSampler,
    scorer: EntropyScorer,
    decider: Decider,
    config: OodConfig,
}

impl<M> ClassifierPipeline<M>
where
    M: StochasticModel<Output = ClassifierOutput>,
{
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `mc_samples` is zero.
    pub fn new(model: M, config: &OodConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            model,
            sampler: StochasticSampler::from_config(config)?,
            scorer: EntropyScorer::new(),
            decider: Decider::for_method(config, ScoreMethod::Entropy),
            config: config.clone(),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M> SampleScorer for ClassifierPipeline<M>
where
    M: StochasticModel<Output = ClassifierOutput>,
{
    fn method(&self) -> ScoreMethod {
        ScoreMethod::Entropy
    }

    fn threshold(&self) -> f64 {
        self.decider.threshold()
    }

    fn assess(&mut self, input: &ImageTensor) -> Result<Assessment, InferenceError> {
        reject_blank(input)?;
        let batch = self.sampler.draw(&mut self.model, input)?;
        let score = self.scorer.score_logits(&batch)?;
        Ok(Assessment {
            method: ScoreMethod::Entropy,
            score: score.entropy,
            decision: self.decider.decide(score.entropy),
            predicted: Some(ClassPrediction {
                index: score.predicted_class,
                name: self.config.class_name(score.predicted_class),
                confidence: score.confidence,
            }),
        })
    }
}

/// MC-dropout VAE scored by expected negative ELBO plus latent variance
#[derive(Debug)]
pub struct LatentElboPipeline<M> {
    model: M,
    sampler: StochasticSampler,
    scorer: LatentElboScorer,
    decider: Decider,
}

impl<M> LatentElboPipeline<M>
where
    M: StochasticModel<Output = VaeOutput>,
{
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `mc_samples` is zero.
    pub fn new(model: M, config: &OodConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            model,
            sampler: StochasticSampler::from_config(config)?,
            scorer: LatentElboScorer::from_config(config),
            decider: Decider::for_method(config, ScoreMethod::LatentElbo),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M> SampleScorer for LatentElboPipeline<M>
where
    M: StochasticModel<Output = VaeOutput>,
{
    fn method(&self) -> ScoreMethod {
        ScoreMethod::LatentElbo
    }

    fn threshold(&self) -> f64 {
        self.decider.threshold()
    }

    fn assess(&mut self, input: &ImageTensor) -> Result<Assessment, InferenceError> {
        reject_blank(input)?;
        let batch = self.sampler.draw(&mut self.model, input)?;
        let score = self.scorer.score(&batch, input)?;
        Ok(Assessment {
            method: ScoreMethod::LatentElbo,
            score: score.score,
            decision: self.decider.decide(score.score),
            predicted: None,
        })
    }
}

/// MC-dropout VAE scored in pixel space
#[derive(Debug)]
pub struct PixelVariancePipeline<M> {
    model: M,
    sampler: StochasticSampler,
    scorer: PixelVarianceScorer,
    decider: Decider,
}

impl<M> PixelVariancePipeline<M>
where
    M: StochasticModel<Output = VaeOutput>,
{
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `mc_samples` is zero.
    pub fn new(model: M, config: &OodConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            model,
            sampler: StochasticSampler::from_config(config)?,
            scorer: PixelVarianceScorer::new(),
            decider: Decider::for_method(config, ScoreMethod::PixelVariance),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M> SampleScorer for PixelVariancePipeline<M>
where
    M: StochasticModel<Output = VaeOutput>,
{
    fn method(&self) -> ScoreMethod {
        ScoreMethod::PixelVariance
    }

    fn threshold(&self) -> f64 {
        self.decider.threshold()
    }

    fn assess(&mut self, input: &ImageTensor) -> Result<Assessment, InferenceError> {
        reject_blank(input)?;
        let batch = self.sampler.draw(&mut self.model, input)?;
        let score = self.scorer.score(&batch, input)?;
        Ok(Assessment {
            method: ScoreMethod::PixelVariance,
            score: score.score,
            decision: self.decider.decide(score.score),
            predicted: None,
        })
    }
}
