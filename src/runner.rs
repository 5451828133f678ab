//! Evaluation engine.
//!
//! Drives a scorer over an ID collection and then an OOD collection, builds
//! the ledger, and once both are exhausted computes metrics and writes the
//! run's artifacts. Undecodable samples and samples whose shape the model
//! cannot take are skipped and counted; anything else that goes wrong aborts
//! the run with the ledger rows produced so far left on disk and no summary,
//! metrics or report files.

use crate::config::{ConfigError, OodConfig};
use crate::dataset::{CorpusLabel, DatasetError, Decoder, ImageFolder, Sample};
use crate::decision::{Decision, ScoreMethod};
use crate::ledger::{ClosedLedger, EvaluationRecord, Ledger};
use crate::metrics::{MetricsError, RunMetrics, StatConfig};
use crate::model::{InferenceError, McDropoutClassifier, McDropoutVae};
use crate::pipeline::{
    ClassifierPipeline, LatentElboPipeline, PixelVariancePipeline, SampleScorer,
};
use crate::report::{ReportBuilder, RunReport};
use crate::run::{Run, RunVersioner, SealedRun};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can abort an evaluation run
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    #[error("No {label} samples found in {root}")]
    EmptyCollection { label: CorpusLabel, root: String },

    #[error("No valid {0} samples left after skipping undecodable inputs")]
    NoValidSamples(CorpusLabel),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Metric computation failed: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Load the reference model for `method` and wrap it in its pipeline
///
/// # Errors
///
/// Returns `RunnerError::ModelNotFound` if the weight file does not exist,
/// or the load/config error otherwise.
pub fn load_scorer(
    method: ScoreMethod,
    model_path: &Path,
    config: &OodConfig,
) -> Result<Box<dyn SampleScorer>, RunnerError> {
    if !model_path.is_file() {
        return Err(RunnerError::ModelNotFound(model_path.display().to_string()));
    }
    info!(method = %method, model = %model_path.display(), "Loading model");

    let scorer: Box<dyn SampleScorer> = match method {
        ScoreMethod::Entropy => {
            let model = McDropoutClassifier::load(model_path, config.seed)?;
            Box::new(ClassifierPipeline::new(model, config)?)
        }
        ScoreMethod::LatentElbo => {
            let model = McDropoutVae::load(model_path, config.seed)?;
            Box::new(LatentElboPipeline::new(model, config)?)
        }
        ScoreMethod::PixelVariance => {
            let model = McDropoutVae::load(model_path, config.seed)?;
            Box::new(PixelVariancePipeline::new(model, config)?)
        }
    };
    Ok(scorer)
}

/// Per-collection tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionTally {
    pub scored: usize,
    pub skipped: usize,
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: SealedRun,
    pub ledger: ClosedLedger,
    pub report: RunReport,
    pub id: CollectionTally,
    pub ood: CollectionTally,
}

/// Evaluation runner: one call to `run` is one versioned run
#[derive(Debug, Clone)]
pub struct EvaluationRunner {
    config: OodConfig,
    versioner: RunVersioner,
}

impl EvaluationRunner {
    /// Create a runner writing runs under `output_base`
    #[must_use]
    pub fn new<P: AsRef<Path>>(config: OodConfig, output_base: P) -> Self {
        Self {
            config,
            versioner: RunVersioner::new(output_base),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &OodConfig {
        &self.config
    }

    /// Evaluate two folders; empty folders are rejected before a run
    /// directory is allocated
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::EmptyCollection` for a folder with no candidate
    /// files, or any error from [`EvaluationRunner::run`].
    pub fn run_folders<S, D>(
        &self,
        scorer: &mut S,
        id: &ImageFolder<D>,
        ood: &ImageFolder<D>,
    ) -> Result<RunOutcome, RunnerError>
    where
        S: SampleScorer + ?Sized,
        D: Decoder,
    {
        for (label, folder) in [(CorpusLabel::Id, id), (CorpusLabel::Ood, ood)] {
            if folder.is_empty() {
                return Err(RunnerError::EmptyCollection {
                    label,
                    root: folder.root().display().to_string(),
                });
            }
        }
        self.run(scorer, id.iter(), ood.iter())
    }

    /// Score both collections into a fresh run and finalize it
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::NoValidSamples` if a collection yields no
    /// valid samples, `RunnerError::Inference` on the first inference
    /// failure other than a shape mismatch, `RunnerError::Metrics` if metrics cannot be computed, or an
    /// IO error while writing artifacts.
    pub fn run<S, I, J>(&self, scorer: &mut S, id: I, ood: J) -> Result<RunOutcome, RunnerError>
    where
        S: SampleScorer + ?Sized,
        I: IntoIterator<Item = Sample>,
        J: IntoIterator<Item = Sample>,
    {
        let run = self.versioner.allocate()?;
        let method = scorer.method();
        info!(
            run_id = run.id(),
            method = %method,
            threshold = scorer.threshold(),
            mc_samples = self.config.mc_samples,
            "Starting evaluation"
        );

        let mut ledger = Ledger::create(method, run.ledger_path())?;
        let id_tally = self.score_collection(scorer, CorpusLabel::Id, id, &mut ledger, &run)?;
        let ood_tally = self.score_collection(scorer, CorpusLabel::Ood, ood, &mut ledger, &run)?;
        let ledger = ledger.close()?;

        let metrics = RunMetrics::compute(&ledger, scorer.threshold(), &self.config)?;
        let alpha = (method == ScoreMethod::LatentElbo).then_some(self.config.alpha_weight);
        let report = ReportBuilder::new(run.id())
            .with_stat_config(StatConfig::from_config(&self.config))
            .with_mc_samples(self.config.mc_samples)
            .with_alpha_weight(alpha)
            .with_skipped(id_tally.skipped, ood_tally.skipped)
            .build(metrics);

        // Render everything before touching the filesystem
        let metrics_json = report.metrics.to_json()?;
        let summary = report.summary_text();
        let markdown = report.to_markdown();
        write_artifacts(&[
            (run.metrics_path(), metrics_json.as_str()),
            (run.summary_path(), summary.as_str()),
            (run.report_path(), markdown.as_str()),
        ])?;

        info!(
            run_id = run.id(),
            auroc = report.metrics.auroc,
            aupr = report.metrics.aupr,
            id_mean = report.metrics.id.mean,
            ood_mean = report.metrics.ood.mean,
            "Run completed"
        );

        Ok(RunOutcome {
            run: run.seal(report.metrics.clone()),
            ledger,
            report,
            id: id_tally,
            ood: ood_tally,
        })
    }

    fn score_collection<S, I, W>(
        &self,
        scorer: &mut S,
        label: CorpusLabel,
        samples: I,
        ledger: &mut Ledger<W>,
        run: &Run,
    ) -> Result<CollectionTally, RunnerError>
    where
        S: SampleScorer + ?Sized,
        I: IntoIterator<Item = Sample>,
        W: Write,
    {
        info!(corpus = %label, "Processing collection");
        let mut tally = CollectionTally::default();

        for sample in samples {
            if sample.is_blank() {
                warn!(corpus = %label, path = %sample.path.display(), "Skipping blank sample");
                tally.skipped += 1;
                continue;
            }

            let assessment = match scorer.assess(&sample.input) {
                Ok(assessment) => assessment,
                Err(e @ (InferenceError::ShapeMismatch { .. } | InferenceError::BlankInput)) => {
                    warn!(
                        corpus = %label,
                        path = %sample.path.display(),
                        error = %e,
                        "Skipping sample the model cannot take"
                    );
                    tally.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            debug!(
                corpus = %label,
                key = %sample.key,
                score = assessment.score,
                decision = %assessment.decision,
                "Scored sample"
            );

            if self.config.sort_images {
                copy_sorted(run, &sample, assessment.score, assessment.decision);
            }

            ledger.append(EvaluationRecord {
                key: sample.key,
                label,
                score: assessment.score,
                decision: assessment.decision,
                predicted_class: assessment.predicted.map(|p| p.name),
                path: sample.path,
            })?;
            tally.scored += 1;
        }

        info!(
            corpus = %label,
            scored = tally.scored,
            skipped = tally.skipped,
            "Collection done"
        );
        if tally.scored == 0 {
            return Err(RunnerError::NoValidSamples(label));
        }
        Ok(tally)
    }
}

fn staged_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write every artifact to a `.tmp` sibling, then rename them all into place.
/// On failure nothing from this call is left behind.
fn write_artifacts(artifacts: &[(PathBuf, &str)]) -> std::io::Result<()> {
    let mut staged = Vec::with_capacity(artifacts.len());
    for (path, content) in artifacts {
        let tmp = staged_path(path);
        if let Err(e) = std::fs::write(&tmp, content) {
            let _ = std::fs::remove_file(&tmp);
            for (tmp, _) in &staged {
                let _ = std::fs::remove_file(tmp);
            }
            return Err(e);
        }
        staged.push((tmp, path));
    }

    for (i, (tmp, path)) in staged.iter().enumerate() {
        if let Err(e) = std::fs::rename(tmp, path) {
            for (_, done) in &staged[..i] {
                let _ = std::fs::remove_file(done);
            }
            for (pending, _) in &staged[i..] {
                let _ = std::fs::remove_file(pending);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Copy the input into `sorted_images/Predicted_<decision>/`; failures only warn
fn copy_sorted(run: &Run, sample: &Sample, score: f64, decision: Decision) {
    let dir = run.sorted_dir(decision);
    let dest = dir.join(format!("[{score:.4}]_{decision}_{}", sample.key));
    let result = std::fs::create_dir_all(&dir).and_then(|()| std::fs::copy(&sample.path, &dest));
    if let Err(e) = result {
        warn!(path = %sample.path.display(), error = %e, "Failed to copy sorted image");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::model::ImageTensor;
    use crate::pipeline::Assessment;
    use tempfile::TempDir;

    /// Scores a sample by the first element of its tensor
    struct FirstPixelScorer {
        threshold: f64,
        fail_on: Option<f64>,
    }

    impl SampleScorer for FirstPixelScorer {
        fn method(&self) -> ScoreMethod {
            ScoreMethod::PixelVariance
        }

        fn threshold(&self) -> f64 {
            self.threshold
        }

        fn assess(&mut self, input: &ImageTensor) -> Result<Assessment, InferenceError> {
            if input.len() != 1 {
                return Err(InferenceError::ShapeMismatch {
                    context: "first-pixel input",
                    expected: 1,
                    actual: input.len(),
                });
            }
            let score = input.data[0];
            if self.fail_on == Some(score) {
                return Err(InferenceError::InferenceFailed("device lost".to_string()));
            }
            Ok(Assessment {
                method: ScoreMethod::PixelVariance,
                score,
                decision: if score > self.threshold {
                    Decision::Ood
                } else {
                    Decision::Id
                },
                predicted: None,
            })
        }
    }

    fn scorer() -> FirstPixelScorer {
        FirstPixelScorer {
            threshold: 0.5,
            fail_on: None,
        }
    }

    fn sample(name: &str, value: f64) -> Sample {
        Sample::new(
            PathBuf::from(format!("/data/{name}")),
            ImageTensor::new(1, 1, 1, vec![value]).unwrap(),
        )
    }

    #[test]
    fn test_run_writes_all_artifacts() {
        let dir = TempDir::new().unwrap();
        let runner = EvaluationRunner::new(OodConfig::default(), dir.path());

        let id = vec![sample("a", 0.1), Sample::blank("/data/bad".into()), sample("b", 0.3)];
        let ood = vec![sample("c", 0.9), sample("d", 0.7)];
        let outcome = runner.run(&mut scorer(), id, ood).unwrap();

        assert_eq!(outcome.run.id(), 1);
        assert_eq!(outcome.id, CollectionTally { scored: 2, skipped: 1 });
        assert_eq!(outcome.ood, CollectionTally { scored: 2, skipped: 0 });
        assert_eq!(outcome.ledger.len(), 4);
        assert_eq!(outcome.report.summary.id_skipped, 1);
        assert_eq!(outcome.run.metrics().auroc, 1.0);

        let run_dir = dir.path().join("run_1");
        assert!(run_dir.join("ledger_run_1.csv").is_file());
        assert!(run_dir.join("summary_run_1.txt").is_file());
        assert!(run_dir.join("metrics_run_1.json").is_file());
        assert!(run_dir.join("report_run_1.md").is_file());

        let csv = std::fs::read_to_string(run_dir.join("ledger_run_1.csv")).unwrap();
        assert_eq!(csv, outcome.ledger.to_csv());
        assert!(!csv.contains("bad"));
    }

    #[test]
    fn test_empty_group_is_fatal_without_summary() {
        let dir = TempDir::new().unwrap();
        let runner = EvaluationRunner::new(OodConfig::default(), dir.path());

        let id = vec![sample("a", 0.1)];
        let ood = vec![Sample::blank("/data/x".into())];
        let result = runner.run(&mut scorer(), id, ood);
        assert!(matches!(
            result,
            Err(RunnerError::NoValidSamples(CorpusLabel::Ood))
        ));

        let run_dir = dir.path().join("run_1");
        let csv = std::fs::read_to_string(run_dir.join("ledger_run_1.csv")).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(!run_dir.join("summary_run_1.txt").exists());
        assert!(!run_dir.join("metrics_run_1.json").exists());
    }

    #[test]
    fn test_inference_failure_aborts_run() {
        let dir = TempDir::new().unwrap();
        let runner = EvaluationRunner::new(OodConfig::default(), dir.path());
        let mut failing = FirstPixelScorer {
            threshold: 0.5,
            fail_on: Some(0.9),
        };

        let result = runner.run(
            &mut failing,
            vec![sample("a", 0.1)],
            vec![sample("c", 0.9)],
        );
        assert!(matches!(result, Err(RunnerError::Inference(_))));
        assert!(!dir.path().join("run_1/metrics_run_1.json").exists());
    }

    #[test]
    fn test_misshaped_sample_is_skipped() {
        let dir = TempDir::new().unwrap();
        let runner = EvaluationRunner::new(OodConfig::default(), dir.path());

        let rgb = Sample::new(
            PathBuf::from("/data/rgb.json"),
            ImageTensor::new(3, 1, 1, vec![0.2, 0.2, 0.2]).unwrap(),
        );
        let id = vec![sample("a", 0.1), rgb, sample("b", 0.2)];
        let outcome = runner
            .run(&mut scorer(), id, vec![sample("c", 0.9)])
            .unwrap();

        assert_eq!(outcome.id, CollectionTally { scored: 2, skipped: 1 });
        assert_eq!(outcome.report.summary.id_skipped, 1);
        let csv = std::fs::read_to_string(dir.path().join("run_1/ledger_run_1.csv")).unwrap();
        assert!(!csv.contains("rgb.json"));
        assert_eq!(csv.lines().count(), 4);
    }

    #[test]
    fn test_write_artifacts_leaves_nothing_on_failure() {
        let dir = TempDir::new().unwrap();
        let metrics = dir.path().join("metrics_run_1.json");
        let summary = dir.path().join("summary_run_1.txt");
        let unwritable = dir.path().join("missing/report_run_1.md");

        let result = write_artifacts(&[
            (metrics.clone(), "{}"),
            (summary.clone(), "summary"),
            (unwritable, "# report"),
        ]);

        assert!(result.is_err());
        assert!(!metrics.exists());
        assert!(!summary.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_artifacts_renames_into_place() {
        let dir = TempDir::new().unwrap();
        let metrics = dir.path().join("metrics_run_1.json");
        write_artifacts(&[(metrics.clone(), "{}")]).unwrap();

        assert_eq!(std::fs::read_to_string(&metrics).unwrap(), "{}");
        assert!(!dir.path().join("metrics_run_1.json.tmp").exists());
    }

    #[test]
    fn test_repeated_runs_get_new_directories() {
        let dir = TempDir::new().unwrap();
        let runner = EvaluationRunner::new(OodConfig::default(), dir.path());
        for expected in 1..=2 {
            let outcome = runner
                .run(
                    &mut scorer(),
                    vec![sample("a", 0.1)],
                    vec![sample("c", 0.9)],
                )
                .unwrap();
            assert_eq!(outcome.run.id(), expected);
        }
    }

    #[test]
    fn test_sorted_images() {
        let dir = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let src = data.path().join("cat.json");
        std::fs::write(&src, "{}").unwrap();

        let config = OodConfig {
            sort_images: true,
            ..OodConfig::default()
        };
        let runner = EvaluationRunner::new(config, dir.path());
        let id = vec![Sample::new(
            src,
            ImageTensor::new(1, 1, 1, vec![0.25]).unwrap(),
        )];
        runner
            .run(&mut scorer(), id, vec![sample("missing.json", 0.9)])
            .unwrap();

        let copied = dir
            .path()
            .join("run_1/sorted_images/Predicted_ID/[0.2500]_ID_cat.json");
        assert!(copied.is_file());
    }

    #[test]
    fn test_run_folders_rejects_empty_before_allocating() {
        let out = TempDir::new().unwrap();
        let id_dir = TempDir::new().unwrap();
        let ood_dir = TempDir::new().unwrap();
        let tensor = ImageTensor::new(1, 1, 1, vec![0.2]).unwrap();
        std::fs::write(
            id_dir.path().join("a.json"),
            serde_json::to_string(&tensor).unwrap(),
        )
        .unwrap();

        let id = ImageFolder::open(id_dir.path(), crate::dataset::JsonTensorDecoder).unwrap();
        let ood = ImageFolder::open(ood_dir.path(), crate::dataset::JsonTensorDecoder).unwrap();
        let runner = EvaluationRunner::new(OodConfig::default(), out.path());
        let result = runner.run_folders(&mut scorer(), &id, &ood);

        assert!(matches!(
            result,
            Err(RunnerError::EmptyCollection {
                label: CorpusLabel::Ood,
                ..
            })
        ));
        assert!(!out.path().join("run_1").exists());
    }

    #[test]
    fn test_load_scorer_missing_model() {
        let result = load_scorer(
            ScoreMethod::Entropy,
            Path::new("/nonexistent/weights.json"),
            &OodConfig::default(),
        );
        assert!(matches!(result, Err(RunnerError::ModelNotFound(_))));
    }
}
