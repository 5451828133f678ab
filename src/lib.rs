//! # MC OOD Eval
//!
//! Out-of-distribution detection for image models by Monte Carlo uncertainty,
//! plus the batch evaluation that measures how well the score separates an
//! in-distribution corpus from an out-of-distribution one.
//!
//! ## Estimators
//!
//! - **Entropy**: predictive entropy of the mean class distribution over S
//!   MC-dropout passes of a classifier
//! - **Latent ELBO**: expected negative ELBO plus α times the summed
//!   variance of the latent mean over S passes of a VAE
//! - **Pixel variance**: reconstruction MSE of the mean reconstruction plus
//!   the mean per-pixel variance over S passes of a VAE
//!
//! Scores from different estimators live on different scales; each has its
//! own threshold.
//!
//! ## Architecture
//!
//! ```text
//! RunVersioner  ──▶  <base>/run_<i>/
//!        │
//! ID collection, OOD collection (ImageFolder → Sample)
//!        ↓
//! StochasticSampler (S passes, stochastic mode forced on)
//!        ↓
//! EntropyScorer | LatentElboScorer | PixelVarianceScorer
//!        ↓
//! Decider (score > threshold ⇒ OOD)
//!        ↓
//! Ledger (append-only CSV)  →  RunMetrics (AUROC, AUPR, curves)
//!        ↓
//! Summary, metrics JSON, markdown report
//! ```

pub mod bayesian;
pub mod config;
pub mod dataset;
pub mod decision;
pub mod detect;
pub mod entropy;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod run;
pub mod runner;
pub mod sampler;

pub use bayesian::{BayesianScore, LatentElboScorer, PixelScore, PixelVarianceScorer};
pub use config::{ConfigError, EvalPaths, OodConfig};
pub use dataset::{CorpusLabel, DatasetError, Decoder, ImageFolder, JsonTensorDecoder, Sample};
pub use decision::{Decider, Decision, ScoreMethod};
pub use detect::{detect, Detection};
pub use entropy::{EntropyScore, EntropyScorer};
pub use ledger::{ClosedLedger, EvaluationRecord, Ledger};
pub use metrics::{
    aupr, auroc, bootstrap_ci, pr_curve, roc_curve, welch_t_test, GroupStats, Histogram,
    MetricsError, PrPoint, RocPoint, RunMetrics, SignificanceResult, StatConfig,
};
pub use model::{
    ClassifierOutput, ClassifierWeights, ImageTensor, InferenceError, McDropoutClassifier,
    McDropoutVae, StochasticModel, VaeOutput, VaeWeights,
};
pub use pipeline::{
    Assessment, ClassPrediction, ClassifierPipeline, LatentElboPipeline, PixelVariancePipeline,
    SampleScorer,
};
pub use report::{ReportBuilder, ReportMetadata, RunReport, RunSummary};
pub use run::{Run, RunVersioner, SealedRun};
pub use runner::{load_scorer, CollectionTally, EvaluationRunner, RunOutcome, RunnerError};
pub use sampler::{McBatch, StochasticSampler};
