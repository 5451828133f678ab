//! MC OOD Eval CLI
//!
//! Monte Carlo uncertainty OOD scoring and evaluation

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mc_ood_eval::{
    detect, load_scorer, EvalPaths, EvaluationRunner, ImageFolder, ImageTensor,
    JsonTensorDecoder, OodConfig, ScoreMethod,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mc-ood-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Model family and scoring method
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    /// MC-dropout classifier, predictive entropy
    Classifier,
    /// MC-dropout VAE, expected negative ELBO plus latent variance
    Vae,
    /// MC-dropout VAE, reconstruction MSE plus pixel variance
    Pixel,
}

impl From<Kind> for ScoreMethod {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Classifier => Self::Entropy,
            Kind::Vae => Self::LatentElbo,
            Kind::Pixel => Self::PixelVariance,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Score an ID and an OOD collection into a new numbered run
    Evaluate {
        /// Model family
        #[arg(long, value_enum)]
        kind: Kind,

        /// Model weights (JSON)
        #[arg(long)]
        model: PathBuf,

        /// In-distribution collection
        #[arg(long)]
        id_dir: PathBuf,

        /// Out-of-distribution collection
        #[arg(long)]
        ood_dir: PathBuf,

        /// Base directory for run_<i> output directories
        #[arg(long)]
        output: PathBuf,

        /// Configuration file (YAML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stochastic passes per sample (overrides config)
        #[arg(long)]
        samples: Option<usize>,

        /// Decision threshold for the selected method (overrides config)
        #[arg(long)]
        threshold: Option<f64>,

        /// Latent-variance weight (overrides config)
        #[arg(long)]
        alpha: Option<f64>,
    },

    /// Score a single input tensor
    Detect {
        /// Model family
        #[arg(long, value_enum)]
        kind: Kind,

        /// Model weights (JSON)
        #[arg(long)]
        model: PathBuf,

        /// Input tensor (JSON)
        #[arg(long)]
        input: PathBuf,

        /// Configuration file (YAML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration as YAML
    Config,
}

fn load_config(path: Option<&Path>) -> Result<OodConfig> {
    match path {
        Some(path) => OodConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(OodConfig::default()),
    }
}

fn apply_overrides(
    config: &mut OodConfig,
    method: ScoreMethod,
    samples: Option<usize>,
    threshold: Option<f64>,
    alpha: Option<f64>,
) -> Result<()> {
    if let Some(samples) = samples {
        config.mc_samples = samples;
    }
    if let Some(threshold) = threshold {
        match method {
            ScoreMethod::Entropy => config.entropy_threshold = threshold,
            ScoreMethod::LatentElbo => config.anomaly_threshold = threshold,
            ScoreMethod::PixelVariance => config.pixel_threshold = threshold,
        }
    }
    if let Some(alpha) = alpha {
        config.alpha_weight = alpha;
    }
    config.validate().context("Invalid configuration")?;
    Ok(())
}

fn evaluate(method: ScoreMethod, paths: &EvalPaths, config: OodConfig) -> Result<()> {
    let mut scorer = load_scorer(method, &paths.model_path, &config)?;
    let id = ImageFolder::open(&paths.id_dir, JsonTensorDecoder)?;
    let ood = ImageFolder::open(&paths.ood_dir, JsonTensorDecoder)?;

    let runner = EvaluationRunner::new(config, &paths.output_base);
    let outcome = runner.run_folders(&mut scorer, &id, &ood)?;

    println!("{}", outcome.report.summary_text());
    println!("Results saved to: {}", outcome.run.dir().display());
    Ok(())
}

fn detect_one(method: ScoreMethod, model: &Path, input: &Path, config: &OodConfig) -> Result<()> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read input {}", input.display()))?;
    let tensor: ImageTensor =
        serde_json::from_str(&content).context("Input is not a valid tensor")?;
    tensor.check_shape()?;

    let mut scorer = load_scorer(method, model, config)?;
    let detection = detect(&mut scorer, &tensor)?;
    println!("{detection}");
    Ok(())
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    let result = match cli.command {
        Commands::Evaluate {
            kind,
            model,
            id_dir,
            ood_dir,
            output,
            config,
            samples,
            threshold,
            alpha,
        } => {
            let method = ScoreMethod::from(kind);
            tracing::info!(
                method = %method,
                model = %model.display(),
                id_dir = %id_dir.display(),
                ood_dir = %ood_dir.display(),
                output = %output.display(),
                "Starting evaluation"
            );
            let paths = EvalPaths {
                model_path: model,
                id_dir,
                ood_dir,
                output_base: output,
            };
            load_config(config.as_deref()).and_then(|mut cfg| {
                apply_overrides(&mut cfg, method, samples, threshold, alpha)?;
                evaluate(method, &paths, cfg)
            })
        }
        Commands::Detect {
            kind,
            model,
            input,
            config,
        } => {
            let method = ScoreMethod::from(kind);
            tracing::info!(method = %method, input = %input.display(), "Detecting");
            load_config(config.as_deref())
                .and_then(|cfg| detect_one(method, &model, &input, &cfg))
        }
        Commands::Config => OodConfig::default()
            .to_yaml()
            .map(|yaml| print!("{yaml}"))
            .map_err(anyhow::Error::from),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
