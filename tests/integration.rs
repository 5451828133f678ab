//! Integration tests for the mc-ood-eval CLI and library.
//!
//! These tests verify end-to-end functionality including:
//! - Classifier and VAE evaluation runs over tensor folders
//! - Run directory versioning and artifact layout
//! - Single-input detection
//! - CLI commands and exit codes

// Allow less strict lints for test code
#![allow(clippy::needless_raw_string_hashes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::float_cmp)]

use mc_ood_eval::{
    detect, load_scorer, ClassifierWeights, Decision, EvaluationRunner, ImageFolder, ImageTensor,
    JsonTensorDecoder, OodConfig, RunMetrics, RunnerError, ScoreMethod, VaeWeights,
};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

/// Three-class head that is very sure about class 0 for bright inputs and
/// close to uniform for dim ones
fn classifier_weights() -> ClassifierWeights {
    ClassifierWeights {
        weights: vec![vec![5.0; 4], vec![0.0; 4], vec![0.0; 4]],
        bias: vec![0.0; 3],
        dropout: 0.1,
    }
}

fn vae_weights() -> VaeWeights {
    VaeWeights {
        encoder_mean: vec![vec![0.5, 0.5, 0.0, 0.0], vec![0.0, 0.0, 0.5, 0.5]],
        encoder_mean_bias: vec![0.0, 0.0],
        encoder_log_variance: vec![vec![0.0; 4], vec![0.0; 4]],
        encoder_log_variance_bias: vec![-4.0, -4.0],
        decoder: vec![
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 1.0],
        ],
        decoder_bias: vec![0.0; 4],
        dropout: 0.2,
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) {
    std::fs::write(path, serde_json::to_string(value).unwrap()).unwrap();
}

fn write_tensor(dir: &Path, name: &str, data: [f64; 4]) -> PathBuf {
    let path = dir.join(name);
    write_json(&path, &ImageTensor::new(1, 2, 2, data.to_vec()).unwrap());
    path
}

struct Workspace {
    _root: TempDir,
    model: PathBuf,
    id_dir: PathBuf,
    ood_dir: PathBuf,
    output: PathBuf,
}

fn workspace<T: serde::Serialize>(weights: &T) -> Workspace {
    let root = TempDir::new().unwrap();
    let model = root.path().join("weights.json");
    write_json(&model, weights);

    let id_dir = root.path().join("animals");
    let ood_dir = root.path().join("pokemon");
    std::fs::create_dir_all(id_dir.join("cat")).unwrap();
    std::fs::create_dir_all(&ood_dir).unwrap();

    write_tensor(&id_dir, "id_1.json", [1.0, 0.9, 1.0, 0.8]);
    write_tensor(&id_dir.join("cat"), "id_2.json", [0.9, 1.0, 0.7, 1.0]);
    write_tensor(&id_dir, "id_3.json", [1.0, 1.0, 1.0, 1.0]);
    std::fs::write(id_dir.join("broken.json"), "{ truncated").unwrap();

    write_tensor(&ood_dir, "ood_1.json", [0.01, 0.02, 0.01, 0.01]);
    write_tensor(&ood_dir, "ood_2.json", [0.02, 0.01, 0.0, 0.01]);

    let output = root.path().join("results");
    Workspace {
        model,
        id_dir,
        ood_dir,
        output,
        _root: root,
    }
}

fn run_library(ws: &Workspace, method: ScoreMethod, config: OodConfig) -> mc_ood_eval::RunOutcome {
    let mut scorer = load_scorer(method, &ws.model, &config).unwrap();
    let id = ImageFolder::open(&ws.id_dir, JsonTensorDecoder).unwrap();
    let ood = ImageFolder::open(&ws.ood_dir, JsonTensorDecoder).unwrap();
    EvaluationRunner::new(config, &ws.output)
        .run_folders(&mut scorer, &id, &ood)
        .unwrap()
}

// ============================================================================
// Library end-to-end tests
// ============================================================================

#[test]
fn test_classifier_evaluation_end_to_end() {
    let ws = workspace(&classifier_weights());
    let outcome = run_library(&ws, ScoreMethod::Entropy, OodConfig::default());

    assert_eq!(outcome.run.id(), 1);
    assert_eq!(outcome.id.scored, 3);
    assert_eq!(outcome.id.skipped, 1);
    assert_eq!(outcome.ood.scored, 2);

    let metrics = outcome.run.metrics();
    assert!((metrics.auroc - 1.0).abs() < 1e-12, "auroc = {}", metrics.auroc);
    assert!((metrics.aupr - 1.0).abs() < 1e-12, "aupr = {}", metrics.aupr);
    assert!(metrics.ood.mean > metrics.id.mean);

    for record in outcome.ledger.records() {
        assert_eq!(record.decision.is_ood(), record.label.is_ood());
        if !record.label.is_ood() {
            assert_eq!(record.predicted_class.as_deref(), Some("butterfly"));
        }
    }

    let run_dir = ws.output.join("run_1");
    let csv = std::fs::read_to_string(run_dir.join("ledger_run_1.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next().unwrap(),
        "Filename,True_Label,Entropy_Score,Final_Prediction,Pred_Class,Full_Path"
    );
    assert_eq!(lines.count(), 5);
    assert!(!csv.contains("broken.json"));

    let summary = std::fs::read_to_string(run_dir.join("summary_run_1.txt")).unwrap();
    assert!(summary.contains("Threshold Used: 0.6000"));
    assert!(summary.contains("ID Samples: 3 (skipped 1)"));

    let json = std::fs::read_to_string(run_dir.join("metrics_run_1.json")).unwrap();
    let parsed: RunMetrics = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.method, ScoreMethod::Entropy);
    assert_eq!(parsed.histogram.bins(), 50);

    assert!(run_dir.join("report_run_1.md").is_file());
    assert!(!run_dir.join("sorted_images").exists());
}

#[test]
fn test_latent_elbo_evaluation() {
    let ws = workspace(&vae_weights());
    let config = OodConfig {
        mc_samples: 10,
        ..OodConfig::default()
    };
    let outcome = run_library(&ws, ScoreMethod::LatentElbo, config);

    let csv = outcome.ledger.to_csv();
    assert!(csv.starts_with("Filename,True_Label,Anomaly_Score,Final_Prediction,Full_Path\n"));
    assert!(outcome.ledger.records().iter().all(|r| r.score >= 0.0));
    assert_eq!(outcome.report.summary.alpha_weight, Some(100.0));
    assert_eq!(outcome.report.summary.mc_samples, 10);
}

#[test]
fn test_pixel_variance_evaluation_uses_own_threshold() {
    let ws = workspace(&vae_weights());
    let config = OodConfig {
        mc_samples: 8,
        pixel_threshold: 1e9,
        ..OodConfig::default()
    };
    let outcome = run_library(&ws, ScoreMethod::PixelVariance, config);

    assert_eq!(outcome.run.metrics().threshold, 1e9);
    assert!(outcome
        .ledger
        .records()
        .iter()
        .all(|r| r.decision == Decision::Id));
    assert!(outcome.report.summary.alpha_weight.is_none());
    assert!(outcome
        .ledger
        .to_csv()
        .starts_with("Filename,True_Label,Pixel_Score,"));
}

#[test]
fn test_repeated_evaluations_are_versioned() {
    let ws = workspace(&classifier_weights());
    let first = run_library(&ws, ScoreMethod::Entropy, OodConfig::default());
    let second = run_library(&ws, ScoreMethod::Entropy, OodConfig::default());

    assert_eq!(first.run.id(), 1);
    assert_eq!(second.run.id(), 2);
    assert!(ws.output.join("run_1/ledger_run_1.csv").is_file());
    assert!(ws.output.join("run_2/ledger_run_2.csv").is_file());
    // same seed, same scores
    assert_eq!(first.ledger.records(), second.ledger.records());
}

#[test]
fn test_sorted_images_copied() {
    let ws = workspace(&classifier_weights());
    let config = OodConfig {
        sort_images: true,
        ..OodConfig::default()
    };
    run_library(&ws, ScoreMethod::Entropy, config);

    let sorted = ws.output.join("run_1/sorted_images");
    let id_copies = std::fs::read_dir(sorted.join("Predicted_ID")).unwrap().count();
    let ood_copies = std::fs::read_dir(sorted.join("Predicted_OOD")).unwrap().count();
    assert_eq!(id_copies, 3);
    assert_eq!(ood_copies, 2);
}

#[test]
fn test_wrong_shape_sample_is_skipped() {
    let ws = workspace(&classifier_weights());
    let rgb = ImageTensor::new(3, 2, 2, vec![0.5; 12]).unwrap();
    write_json(&ws.id_dir.join("rgb.json"), &rgb);

    let outcome = run_library(&ws, ScoreMethod::Entropy, OodConfig::default());

    assert_eq!(outcome.id.scored, 3);
    assert_eq!(outcome.id.skipped, 2);
    let csv = std::fs::read_to_string(ws.output.join("run_1/ledger_run_1.csv")).unwrap();
    assert!(!csv.contains("rgb.json"));
    assert!(ws.output.join("run_1/metrics_run_1.json").is_file());
}

#[test]
fn test_signed_input_is_scored() {
    let ws = workspace(&classifier_weights());
    write_tensor(&ws.id_dir, "normalized.json", [1.5, -0.5, 1.0, -2.0]);

    let outcome = run_library(&ws, ScoreMethod::Entropy, OodConfig::default());

    assert_eq!(outcome.id.scored, 4);
    assert!(outcome
        .ledger
        .records()
        .iter()
        .any(|r| r.key == "normalized.json"));
}

#[test]
fn test_empty_ood_collection_is_fatal() {
    let ws = workspace(&classifier_weights());
    for entry in std::fs::read_dir(&ws.ood_dir).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    let config = OodConfig::default();
    let mut scorer = load_scorer(ScoreMethod::Entropy, &ws.model, &config).unwrap();
    let id = ImageFolder::open(&ws.id_dir, JsonTensorDecoder).unwrap();
    let ood = ImageFolder::open(&ws.ood_dir, JsonTensorDecoder).unwrap();
    let result = EvaluationRunner::new(config, &ws.output).run_folders(&mut scorer, &id, &ood);

    assert!(matches!(result, Err(RunnerError::EmptyCollection { .. })));
    assert!(!ws.output.join("run_1").exists());
}

#[test]
fn test_missing_model_is_fatal() {
    let ws = workspace(&classifier_weights());
    let result = load_scorer(
        ScoreMethod::LatentElbo,
        &ws.model.with_file_name("missing.json"),
        &OodConfig::default(),
    );
    assert!(matches!(result, Err(RunnerError::ModelNotFound(_))));
}

#[test]
fn test_detect_single_input() {
    let ws = workspace(&classifier_weights());
    let config = OodConfig::default();
    let mut scorer = load_scorer(ScoreMethod::Entropy, &ws.model, &config).unwrap();

    let bright = ImageTensor::new(1, 2, 2, vec![1.0; 4]).unwrap();
    let detection = detect(&mut scorer, &bright).unwrap();
    assert_eq!(detection.decision, Decision::Id);
    assert_eq!(detection.predicted_class.as_ref().unwrap().0, 0);

    let dim = ImageTensor::new(1, 2, 2, vec![0.01; 4]).unwrap();
    let detection = detect(&mut scorer, &dim).unwrap();
    assert_eq!(detection.decision, Decision::Ood);
}

#[test]
fn test_config_yaml_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ood.yaml");
    std::fs::write(
        &path,
        r#"
mc_samples: 12
entropy_threshold: 0.4
alpha_weight: 50.0
"#,
    )
    .unwrap();

    let config = OodConfig::load(&path).unwrap();
    assert_eq!(config.mc_samples, 12);
    assert_eq!(config.entropy_threshold, 0.4);
    assert_eq!(config.alpha_weight, 50.0);
    assert_eq!(config.anomaly_threshold, 500.0);
}

// ============================================================================
// CLI Integration Tests
// ============================================================================

fn cli() -> Command {
    Command::new(env!("CARGO_BIN_EXE_mc-ood-eval"))
}

#[test]
fn test_cli_help_command() {
    let output = cli().arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("evaluate"));
    assert!(stdout.contains("detect"));
    assert!(stdout.contains("config"));
}

#[test]
fn test_cli_config_prints_defaults() {
    let output = cli().arg("config").output().unwrap();
    assert!(output.status.success());
    let yaml = String::from_utf8_lossy(&output.stdout);
    let config = OodConfig::from_yaml(&yaml).unwrap();
    assert_eq!(config, OodConfig::default());
}

#[test]
fn test_cli_evaluate() {
    let ws = workspace(&classifier_weights());
    let output = cli()
        .args(["evaluate", "--kind", "classifier", "--samples", "5"])
        .arg("--model")
        .arg(&ws.model)
        .arg("--id-dir")
        .arg(&ws.id_dir)
        .arg("--ood-dir")
        .arg(&ws.ood_dir)
        .arg("--output")
        .arg(&ws.output)
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("OOD Evaluation Summary (Run 1)"));
    assert!(stdout.contains("MC Samples: 5"));
    assert!(ws.output.join("run_1/metrics_run_1.json").is_file());
}

#[test]
fn test_cli_evaluate_missing_model_exits_nonzero() {
    let ws = workspace(&classifier_weights());
    let output = cli()
        .args(["evaluate", "--kind", "vae"])
        .arg("--model")
        .arg(ws.model.with_file_name("nope.json"))
        .arg("--id-dir")
        .arg(&ws.id_dir)
        .arg("--ood-dir")
        .arg(&ws.ood_dir)
        .arg("--output")
        .arg(&ws.output)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Model file not found"));
    assert!(!ws.output.exists());
}

#[test]
fn test_cli_detect() {
    let ws = workspace(&classifier_weights());
    let input = write_tensor(ws.id_dir.as_path(), "probe.json", [1.0, 1.0, 0.9, 1.0]);
    let output = cli()
        .args(["detect", "--kind", "classifier"])
        .arg("--model")
        .arg(&ws.model)
        .arg("--input")
        .arg(&input)
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Prediction: butterfly"));
    assert!(stdout.contains("Result:     ID"));
}
