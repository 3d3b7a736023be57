use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::DocType;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to decode {path} as {encoding}: {reason}")]
    Decoding {
        path: PathBuf,
        encoding: &'static str,
        reason: String,
    },

    #[error("row error rate {failed}/{total} exceeds threshold {threshold:.2}")]
    ThresholdExceeded {
        failed: usize,
        total: usize,
        threshold: f64,
    },

    #[error("insert failed: {0}")]
    Insert(String),

    #[error("failed to load {doc_type} document for {region}: {source}")]
    Load {
        doc_type: DocType,
        region: String,
        #[source]
        source: Box<IngestError>,
    },

    #[error("retry attempts exhausted for {digest} ({attempts} >= {ceiling})")]
    RetryExhausted {
        digest: String,
        attempts: u32,
        ceiling: u32,
    },

    #[error("file not found for retry: {doc_type} {region} {version}")]
    FileNotFoundForRetry {
        doc_type: DocType,
        region: String,
        version: String,
    },

    #[error("file name does not match naming contract: {0}")]
    InvalidFileName(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid row pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid discovery pattern: {0}")]
    InvalidPattern(String),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl IngestError {
    pub fn wrap_load(self, doc_type: DocType, region: &str) -> Self {
        IngestError::Load {
            doc_type,
            region: region.to_string(),
            source: Box::new(self),
        }
    }
}

/// A single row that could not be turned into an item.
#[derive(Debug, Clone, Error)]
#[error("row {row}: {message}")]
pub struct RowParseError {
    pub row: usize,
    pub message: String,
}

/// Non-fatal notice about how a file's layout was interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMappingWarning {
    pub row: Option<usize>,
    pub message: String,
}

impl SchemaMappingWarning {
    pub fn at_row(row: usize, message: impl Into<String>) -> Self {
        Self {
            row: Some(row),
            message: message.into(),
        }
    }

    pub fn file(message: impl Into<String>) -> Self {
        Self {
            row: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaMappingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "row {row}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Collects recovered row failures and decides whether the file as a whole
/// is still acceptable.
#[derive(Debug, Default)]
pub struct RowErrors {
    attempted: usize,
    errors: Vec<RowParseError>,
}

impl RowErrors {
    pub fn record_ok(&mut self) {
        self.attempted += 1;
    }

    pub fn record_err(&mut self, row: usize, message: impl Into<String>) {
        self.attempted += 1;
        self.errors.push(RowParseError {
            row,
            message: message.into(),
        });
    }

    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn errors(&self) -> &[RowParseError] {
        &self.errors
    }

    /// A rate equal to the threshold is accepted; only a strictly greater
    /// rate fails the file.
    pub fn check_threshold(&self, threshold: f64) -> Result<(), IngestError> {
        if self.attempted == 0 {
            return Ok(());
        }
        let rate = self.errors.len() as f64 / self.attempted as f64;
        if rate > threshold {
            return Err(IngestError::ThresholdExceeded {
                failed: self.errors.len(),
                total: self.attempted,
                threshold,
            });
        }
        Ok(())
    }
}
