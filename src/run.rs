//! Run directory allocation and run lifecycle.
//!
//! Every execution gets its own `<base>/run_<i>/`, where `i` is the smallest
//! positive integer not yet taken. Two processes allocating against the same
//! base at the same moment can pick the same `i`; the loser's `create_dir`
//! fails and its run aborts. That race is accepted for manually triggered
//! batch jobs and is not guarded against.

use crate::decision::Decision;
use crate::metrics::RunMetrics;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Allocates fresh numbered run directories under a base directory
#[derive(Debug, Clone)]
pub struct RunVersioner {
    base: PathBuf,
}

impl RunVersioner {
    #[must_use]
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Smallest `i >= 1` such that `run_<i>` does not exist yet
    #[must_use]
    pub fn next_id(&self) -> usize {
        (1..)
            .find(|i| !self.base.join(format!("run_{i}")).exists())
            .unwrap_or(1)
    }

    /// Create the base if needed, then create and return the next run
    ///
    /// # Errors
    ///
    /// Returns an IO error if a directory cannot be created, including
    /// `AlreadyExists` when another process claimed the same id first.
    pub fn allocate(&self) -> io::Result<Run> {
        std::fs::create_dir_all(&self.base)?;
        let id = self.next_id();
        let dir = self.base.join(format!("run_{id}"));
        std::fs::create_dir(&dir)?;
        info!(run_id = id, dir = %dir.display(), "Created run directory");
        Ok(Run { id, dir })
    }
}

/// An open run: owns its directory until metrics are written
#[derive(Debug)]
pub struct Run {
    id: usize,
    dir: PathBuf,
}

impl Run {
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.artifact("ledger", "csv")
    }

    #[must_use]
    pub fn summary_path(&self) -> PathBuf {
        self.artifact("summary", "txt")
    }

    #[must_use]
    pub fn metrics_path(&self) -> PathBuf {
        self.artifact("metrics", "json")
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.artifact("report", "md")
    }

    /// Destination folder for copies of inputs with the given decision
    #[must_use]
    pub fn sorted_dir(&self, decision: Decision) -> PathBuf {
        self.dir
            .join("sorted_images")
            .join(format!("Predicted_{decision}"))
    }

    fn artifact(&self, stem: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{stem}_run_{}.{extension}", self.id))
    }

    /// Close the run once its metrics have been written
    #[must_use]
    pub fn seal(self, metrics: RunMetrics) -> SealedRun {
        info!(run_id = self.id, "Sealed run");
        SealedRun {
            id: self.id,
            dir: self.dir,
            metrics,
        }
    }
}

/// A finished run; nothing can be added to it
#[derive(Debug, Clone)]
pub struct SealedRun {
    id: usize,
    dir: PathBuf,
    metrics: RunMetrics,
}

impl SealedRun {
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }
}
