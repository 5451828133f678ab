//! Report generation for evaluation runs.
//!
//! Renders one run as:
//! - a short plain-text summary (group means, counts, threshold, skips)
//! - a markdown report with group and separability tables
//! - JSON for downstream tooling

use crate::decision::ScoreMethod;
use crate::metrics::{GroupStats, RunMetrics, StatConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use tabled::{Table, Tabled};

/// Full report for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// Headline numbers
    pub summary: RunSummary,
    /// Complete metrics, curves included
    pub metrics: RunMetrics,
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Report title
    pub title: String,
    /// Run number within its base directory
    pub run_id: usize,
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Framework version
    pub framework_version: String,
    /// Statistical configuration used
    pub stat_config: StatConfigSummary,
}

/// Statistical configuration summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatConfigSummary {
    /// Bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level
    pub confidence: f64,
    /// Significance threshold
    pub alpha: f64,
}

impl From<&StatConfig> for StatConfigSummary {
    fn from(config: &StatConfig) -> Self {
        Self {
            bootstrap_n: config.bootstrap_n,
            confidence: config.confidence,
            alpha: config.alpha,
        }
    }
}

/// Headline numbers of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub method: ScoreMethod,
    pub threshold: f64,
    /// Stochastic passes per sample
    pub mc_samples: usize,
    /// Latent-variance weight (latent ELBO method only)
    pub alpha_weight: Option<f64>,
    pub id_count: usize,
    pub ood_count: usize,
    /// Samples skipped because they failed to decode
    pub id_skipped: usize,
    pub ood_skipped: usize,
    pub id_mean: f64,
    pub ood_mean: f64,
    pub auroc: f64,
    pub aupr: f64,
}

/// Collects what a report needs beyond the metrics
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    run_id: usize,
    stat_config: StatConfig,
    mc_samples: usize,
    alpha_weight: Option<f64>,
    skipped: (usize, usize),
}

impl ReportBuilder {
    /// Create a new report builder
    #[must_use]
    pub fn new(run_id: usize) -> Self {
        Self {
            run_id,
            stat_config: StatConfig::default(),
            mc_samples: 0,
            alpha_weight: None,
            skipped: (0, 0),
        }
    }

    /// Set statistical configuration
    #[must_use]
    pub fn with_stat_config(mut self, config: StatConfig) -> Self {
        self.stat_config = config;
        self
    }

    #[must_use]
    pub const fn with_mc_samples(mut self, samples: usize) -> Self {
        self.mc_samples = samples;
        self
    }

    #[must_use]
    pub const fn with_alpha_weight(mut self, alpha: Option<f64>) -> Self {
        self.alpha_weight = alpha;
        self
    }

    /// Skipped (ID, OOD) sample counts
    #[must_use]
    pub const fn with_skipped(mut self, id: usize, ood: usize) -> Self {
        self.skipped = (id, ood);
        self
    }

    /// Build the report around computed metrics
    #[must_use]
    pub fn build(self, metrics: RunMetrics) -> RunReport {
        let summary = RunSummary {
            method: metrics.method,
            threshold: metrics.threshold,
            mc_samples: self.mc_samples,
            alpha_weight: self.alpha_weight,
            id_count: metrics.id.count,
            ood_count: metrics.ood.count,
            id_skipped: self.skipped.0,
            ood_skipped: self.skipped.1,
            id_mean: metrics.id.mean,
            ood_mean: metrics.ood.mean,
            auroc: metrics.auroc,
            aupr: metrics.aupr,
        };

        RunReport {
            metadata: ReportMetadata {
                title: format!("OOD Evaluation Report: {} (Run {})", metrics.method, self.run_id),
                run_id: self.run_id,
                generated_at: Utc::now(),
                framework_version: env!("CARGO_PKG_VERSION").to_string(),
                stat_config: StatConfigSummary::from(&self.stat_config),
            },
            summary,
            metrics,
        }
    }
}

/// Table row for group statistics
#[derive(Tabled)]
struct GroupTableRow {
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Samples")]
    count: usize,
    #[tabled(rename = "Mean Score")]
    mean: String,
    #[tabled(rename = "Std")]
    std: String,
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Flagged OOD")]
    flagged: String,
}

impl From<&GroupStats> for GroupTableRow {
    #[allow(clippy::cast_precision_loss)]
    fn from(stats: &GroupStats) -> Self {
        let rate = if stats.count == 0 {
            0.0
        } else {
            stats.flagged_ood as f64 / stats.count as f64
        };
        Self {
            group: stats.label.to_string(),
            count: stats.count,
            mean: format!(
                "{:.4} [{:.4}-{:.4}]",
                stats.mean, stats.mean_ci.0, stats.mean_ci.1
            ),
            std: format!("{:.4}", stats.std),
            range: format!("{:.4} - {:.4}", stats.min, stats.max),
            flagged: format!("{} ({:.1}%)", stats.flagged_ood, rate * 100.0),
        }
    }
}

impl RunReport {
    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Short plain-text summary written next to the ledger
    #[must_use]
    pub fn summary_text(&self) -> String {
        let s = &self.summary;
        let mut output = String::new();

        writeln!(
            output,
            "--- OOD Evaluation Summary (Run {}) ---",
            self.metadata.run_id
        )
        .ok();
        writeln!(output, "Method: {}", s.method).ok();
        writeln!(output, "MC Samples: {}", s.mc_samples).ok();
        if let Some(alpha) = s.alpha_weight {
            writeln!(output, "Alpha Weight: {alpha}").ok();
        }
        writeln!(output, "ID Samples: {} (skipped {})", s.id_count, s.id_skipped).ok();
        writeln!(
            output,
            "OOD Samples: {} (skipped {})",
            s.ood_count, s.ood_skipped
        )
        .ok();
        writeln!(output, "ID Mean Score: {:.4}", s.id_mean).ok();
        writeln!(output, "OOD Mean Score: {:.4}", s.ood_mean).ok();
        writeln!(output, "Threshold Used: {:.4}", s.threshold).ok();
        writeln!(output, "AUROC: {:.4}", s.auroc).ok();
        writeln!(output, "AUPR: {:.4}", s.aupr).ok();

        output
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let s = &self.summary;
        let m = &self.metrics;
        let mut output = String::new();

        // Title
        writeln!(output, "# {}", self.metadata.title).ok();
        writeln!(output).ok();
        writeln!(
            output,
            "**Generated:** {}",
            self.metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
        .ok();
        writeln!(
            output,
            "**Framework Version:** {}",
            self.metadata.framework_version
        )
        .ok();
        writeln!(output).ok();

        // Summary
        writeln!(output, "## Summary").ok();
        writeln!(output).ok();
        writeln!(output, "| Metric | Value |").ok();
        writeln!(output, "|--------|-------|").ok();
        writeln!(output, "| Method | {} |", s.method).ok();
        writeln!(output, "| Threshold | {:.4} |", s.threshold).ok();
        writeln!(output, "| MC Samples | {} |", s.mc_samples).ok();
        if let Some(alpha) = s.alpha_weight {
            writeln!(output, "| Alpha Weight | {alpha} |").ok();
        }
        writeln!(output, "| AUROC | {:.4} |", s.auroc).ok();
        writeln!(output, "| AUPR | {:.4} |", s.aupr).ok();
        writeln!(output, "| Accuracy | {:.2}% |", m.accuracy * 100.0).ok();
        writeln!(
            output,
            "| Skipped | {} ID, {} OOD |",
            s.id_skipped, s.ood_skipped
        )
        .ok();
        writeln!(output).ok();

        // Groups
        writeln!(output, "## Score Distribution").ok();
        writeln!(output).ok();
        let rows = vec![GroupTableRow::from(&m.id), GroupTableRow::from(&m.ood)];
        let table = Table::new(rows).to_string();
        writeln!(output, "{table}").ok();
        writeln!(output).ok();

        // Significance
        if let Some(test) = &m.significance {
            writeln!(output, "## OOD vs ID").ok();
            writeln!(output).ok();
            writeln!(output, "| t-stat | p-value | Effect Size | Significant |").ok();
            writeln!(output, "|--------|---------|-------------|-------------|").ok();
            writeln!(
                output,
                "| {:.3} | {:.4} | {} ({:.2}) | {} |",
                test.t_statistic,
                test.p_value,
                test.effect_interpretation,
                test.cohens_d,
                if test.is_significant { "Yes" } else { "No" }
            )
            .ok();
            writeln!(output).ok();
        }

        // Curves
        writeln!(output, "## Curves").ok();
        writeln!(output).ok();
        writeln!(output, "- ROC points: {}", m.roc.len()).ok();
        writeln!(output, "- PR points: {}", m.pr.len()).ok();
        writeln!(
            output,
            "- Histogram: {} bins over [{:.4}, {:.4}]",
            m.histogram.bins(),
            m.histogram.edges.first().copied().unwrap_or_default(),
            m.histogram.edges.last().copied().unwrap_or_default()
        )
        .ok();
        writeln!(output).ok();

        // Configuration
        writeln!(output, "## Configuration").ok();
        writeln!(output).ok();
        writeln!(
            output,
            "- Bootstrap resamples: {}",
            self.metadata.stat_config.bootstrap_n
        )
        .ok();
        writeln!(
            output,
            "- Confidence level: {}%",
            self.metadata.stat_config.confidence * 100.0
        )
        .ok();
        writeln!(
            output,
            "- Significance threshold (α): {}",
            self.metadata.stat_config.alpha
        )
        .ok();

        output
    }
}
