//! Append-only evaluation ledger.
//!
//! Each row is written and flushed as soon as it is appended, so a run that
//! fails half way still leaves the rows produced so far on disk. Metrics are
//! only ever computed from a [`ClosedLedger`].

use crate::dataset::CorpusLabel;
use crate::decision::{Decision, ScoreMethod};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One scored sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// File name of the sample
    pub key: String,
    pub label: CorpusLabel,
    pub score: f64,
    pub decision: Decision,
    /// Predicted class name (entropy method only)
    pub predicted_class: Option<String>,
    pub path: PathBuf,
}

impl ScoreMethod {
    /// Fixed CSV header for this method's ledger
    #[must_use]
    pub const fn csv_header(self) -> &'static str {
        match self {
            Self::Entropy => {
                "Filename,True_Label,Entropy_Score,Final_Prediction,Pred_Class,Full_Path"
            }
            Self::LatentElbo => "Filename,True_Label,Anomaly_Score,Final_Prediction,Full_Path",
            Self::PixelVariance => "Filename,True_Label,Pixel_Score,Final_Prediction,Full_Path",
        }
    }
}

/// Quote a CSV field if it contains a delimiter, quote or line break
#[must_use]
pub fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_row(method: ScoreMethod, record: &EvaluationRecord) -> String {
    let mut fields = vec![
        escape_csv(&record.key),
        record.label.to_string(),
        format!("{:.6}", record.score),
        record.decision.to_string(),
    ];
    if method.uses_classifier() {
        fields.push(escape_csv(record.predicted_class.as_deref().unwrap_or("")));
    }
    fields.push(escape_csv(&record.path.to_string_lossy()));
    fields.join(",")
}

/// Open ledger; rows can only be appended
#[derive(Debug)]
pub struct Ledger<W: Write = io::Sink> {
    method: ScoreMethod,
    records: Vec<EvaluationRecord>,
    sink: W,
}

impl Ledger<io::Sink> {
    /// In-memory ledger
    #[must_use]
    pub fn new(method: ScoreMethod) -> Self {
        Self {
            method,
            records: Vec::new(),
            sink: io::sink(),
        }
    }
}

impl Ledger<BufWriter<File>> {
    /// Ledger backed by a new CSV file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the header written.
    pub fn create<P: AsRef<Path>>(method: ScoreMethod, path: P) -> io::Result<Self> {
        Self::with_sink(method, BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> Ledger<W> {
    /// Ledger that mirrors every row to `sink`; the header is written now
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn with_sink(method: ScoreMethod, mut sink: W) -> io::Result<Self> {
        writeln!(sink, "{}", method.csv_header())?;
        sink.flush()?;
        Ok(Self {
            method,
            records: Vec::new(),
            sink,
        })
    }

    #[must_use]
    pub const fn method(&self) -> ScoreMethod {
        self.method
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record and flush it to the sink
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be written. The record is kept
    /// in memory either way.
    pub fn append(&mut self, record: EvaluationRecord) -> io::Result<()> {
        let row = csv_row(self.method, &record);
        self.records.push(record);
        writeln!(self.sink, "{row}")?;
        self.sink.flush()
    }

    /// Count of records with the given true label
    #[must_use]
    pub fn count(&self, label: CorpusLabel) -> usize {
        self.records.iter().filter(|r| r.label == label).count()
    }

    /// Stop accepting rows
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn close(mut self) -> io::Result<ClosedLedger> {
        self.sink.flush()?;
        Ok(ClosedLedger {
            method: self.method,
            records: self.records,
        })
    }
}

/// Completed, read-only ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedLedger {
    method: ScoreMethod,
    records: Vec<EvaluationRecord>,
}

impl ClosedLedger {
    #[must_use]
    pub const fn method(&self) -> ScoreMethod {
        self.method
    }

    #[must_use]
    pub fn records(&self) -> &[EvaluationRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Scores of one true-label group, in ledger order
    #[must_use]
    pub fn scores_for(&self, label: CorpusLabel) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.label == label)
            .map(|r| r.score)
            .collect()
    }

    /// `(is_ood, score)` pairs for curve construction
    #[must_use]
    pub fn labeled_scores(&self) -> Vec<(bool, f64)> {
        self.records
            .iter()
            .map(|r| (r.label.is_ood(), r.score))
            .collect()
    }

    /// Number of records whose decision disagrees with the true label
    #[must_use]
    pub fn misclassified(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.label.is_ood() != r.decision.is_ood())
            .count()
    }

    /// Full CSV rendering, header included
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut output = String::from(self.method.csv_header());
        output.push('\n');
        for record in &self.records {
            output.push_str(&csv_row(self.method, record));
            output.push('\n');
        }
        output
    }
}
