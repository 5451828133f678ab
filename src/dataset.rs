//! Labeled sample collections.
//!
//! A collection is a directory tree of encoded inputs. Files are discovered
//! recursively, filtered by the decoder and visited in sorted path order.
//! A file that fails to decode is not dropped here: it comes out as the
//! blank sentinel so the runner can count and skip it.

use crate::model::ImageTensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while reading a sample collection
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Collection directory not found: {0}")]
    NotFound(String),

    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Invalid collection pattern: {0}")]
    Glob(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// True label of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorpusLabel {
    #[serde(rename = "ID")]
    Id,
    #[serde(rename = "OOD")]
    Ood,
}

impl CorpusLabel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Ood => "OOD",
        }
    }

    #[must_use]
    pub const fn is_ood(self) -> bool {
        matches!(self, Self::Ood)
    }
}

impl fmt::Display for CorpusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded input and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// File name, used as the ledger key
    pub key: String,
    /// Full source path
    pub path: PathBuf,
    pub input: ImageTensor,
}

impl Sample {
    #[must_use]
    pub fn new(path: PathBuf, input: ImageTensor) -> Self {
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self { key, path, input }
    }

    /// Sentinel for an input that could not be decoded
    #[must_use]
    pub fn blank(path: PathBuf) -> Self {
        Self::new(path, ImageTensor::blank())
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.input.is_blank()
    }
}

/// Turns an encoded file into a tensor
pub trait Decoder {
    /// Whether the file looks like something this decoder reads
    fn accepts(&self, path: &Path) -> bool;

    /// Decode one file
    ///
    /// # Errors
    ///
    /// Returns `DatasetError::Decode` for corrupt input, or an IO error.
    fn decode(&self, path: &Path) -> Result<ImageTensor, DatasetError>;
}

/// Reads `ImageTensor` values serialized as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTensorDecoder;

impl Decoder for JsonTensorDecoder {
    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"))
    }

    fn decode(&self, path: &Path) -> Result<ImageTensor, DatasetError> {
        let decode_error = |reason: String| DatasetError::Decode {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path)?;
        let tensor: ImageTensor =
            serde_json::from_str(&content).map_err(|e| decode_error(e.to_string()))?;
        tensor
            .check_shape()
            .map_err(|e| decode_error(e.to_string()))?;
        Ok(tensor)
    }
}

/// A directory tree of inputs read through a [`Decoder`]
#[derive(Debug)]
pub struct ImageFolder<D> {
    root: PathBuf,
    files: Vec<PathBuf>,
    decoder: D,
}

impl<D: Decoder> ImageFolder<D> {
    /// Discover all files under `root` that the decoder accepts
    ///
    /// # Errors
    ///
    /// Returns `DatasetError::NotFound` if `root` is not a directory, or
    /// `DatasetError::Glob` if traversal fails.
    pub fn open<P: AsRef<Path>>(root: P, decoder: D) -> Result<Self, DatasetError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(DatasetError::NotFound(root.display().to_string()));
        }

        let pattern = format!(
            "{}/**/*",
            glob::Pattern::escape(&root.to_string_lossy())
        );
        let entries = glob::glob(&pattern).map_err(|e| DatasetError::Glob(e.to_string()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| DatasetError::Glob(e.to_string()))?;
            if path.is_file() && decoder.accepts(&path) {
                files.push(path);
            }
        }
        // Sort for reproducibility
        files.sort();

        debug!(root = %root.display(), files = files.len(), "Opened collection");
        Ok(Self {
            root,
            files,
            decoder,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of candidate files (before decoding)
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Decode lazily; failures yield the blank sentinel
    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        self.files.iter().map(|path| match self.decoder.decode(path) {
            Ok(input) => Sample::new(path.clone(), input),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to decode sample");
                Sample::blank(path.clone())
            }
        })
    }
}
