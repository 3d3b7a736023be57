use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocType {
    /// Library of definitions (`LOD`).
    Definitions,
    /// Certificate of compliance (`CERT`).
    ComplianceCertificate,
    /// Taxability and administration practices (`TAP`).
    AdministrationPractice,
}

impl DocType {
    pub const ALL: [DocType; 3] = [
        DocType::Definitions,
        DocType::ComplianceCertificate,
        DocType::AdministrationPractice,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocType::Definitions => "LOD",
            DocType::ComplianceCertificate => "CERT",
            DocType::AdministrationPractice => "TAP",
        }
    }

    /// Partition folder under the data root.
    pub fn partition(self) -> &'static str {
        match self {
            DocType::Definitions => "tm",
            DocType::ComplianceCertificate => "cc",
            DocType::AdministrationPractice => "tap",
        }
    }

    pub fn from_partition(folder: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|doc_type| doc_type.partition().eq_ignore_ascii_case(folder))
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let upper = value.trim().to_ascii_uppercase();
        match upper.as_str() {
            "LOD" | "TM" => Ok(DocType::Definitions),
            "CERT" | "COC" | "CC" => Ok(DocType::ComplianceCertificate),
            "TAP" => Ok(DocType::AdministrationPractice),
            _ => Err(format!("unknown document type: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Started,
    Completed,
    Failed,
}

impl LoadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadStatus::Started => "started",
            LoadStatus::Completed => "completed",
            LoadStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(LoadStatus::Started),
            "completed" => Some(LoadStatus::Completed),
            "failed" => Some(LoadStatus::Failed),
            _ => None,
        }
    }
}

/// One captured source file, identified by its partition and file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub doc_type: DocType,
    pub region: String,
    pub version: String,
    pub captured_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionCategory {
    Admin,
    Product,
    Holiday,
}

impl DefinitionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            DefinitionCategory::Admin => "admin",
            DefinitionCategory::Product => "product",
            DefinitionCategory::Holiday => "holiday",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefinitionItem {
    pub category: DefinitionCategory,
    pub code: String,
    pub group_name: Option<String>,
    pub description: String,
    pub taxable: Option<bool>,
    pub exempt: Option<bool>,
    pub included: Option<bool>,
    pub excluded: Option<bool>,
    pub threshold: Option<f64>,
    pub reference: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceItem {
    pub section: String,
    pub question_number: String,
    pub topic: String,
    pub question_text: String,
    pub answer: String,
    pub compliance_met: Option<bool>,
    pub citation: String,
    pub effective_dates: String,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PracticeItem {
    pub group_name: String,
    pub question_number: String,
    pub question_text: String,
    pub answer: String,
    pub compliance_met: Option<bool>,
    pub citation: String,
    pub notes: String,
}

/// Items produced by one normalizer run, tagged by document family.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedItems {
    Definitions(Vec<DefinitionItem>),
    Compliance(Vec<ComplianceItem>),
    Practices(Vec<PracticeItem>),
}

impl NormalizedItems {
    pub fn len(&self) -> usize {
        match self {
            NormalizedItems::Definitions(items) => items.len(),
            NormalizedItems::Compliance(items) => items.len(),
            NormalizedItems::Practices(items) => items.len(),
        }
    }

    pub fn definitions_in(&self, category: DefinitionCategory) -> usize {
        match self {
            NormalizedItems::Definitions(items) => items
                .iter()
                .filter(|item| item.category == category)
                .count(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub digest: String,
    pub region: String,
    pub doc_type: String,
    pub version: String,
    pub status: LoadStatus,
    pub error: Option<String>,
    pub rows: Option<i64>,
    pub attempts: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    /// False when the run was interrupted before this file was picked up.
    pub started: bool,
    pub success: bool,
    pub skipped: bool,
    pub doc_type: DocType,
    pub region: String,
    pub version: String,
    pub path: String,
    pub digest: Option<String>,
    pub rows: Option<usize>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl FileOutcome {
    pub fn pending(file: &SourceFile) -> Self {
        Self {
            started: false,
            success: false,
            skipped: false,
            doc_type: file.doc_type,
            region: file.region.clone(),
            version: file.version.clone(),
            path: file.path.display().to_string(),
            digest: None,
            rows: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.started && !self.success && !self.skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkCounts {
    pub discovered: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_started: usize,
}

impl BulkCounts {
    pub fn tally(outcomes: &[FileOutcome]) -> Self {
        let mut counts = BulkCounts {
            discovered: outcomes.len(),
            ..BulkCounts::default()
        };
        for outcome in outcomes {
            if !outcome.started {
                counts.not_started += 1;
            } else if outcome.skipped {
                counts.skipped += 1;
            } else if outcome.success {
                counts.succeeded += 1;
            } else {
                counts.failed += 1;
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub data_root: String,
    pub db_path: String,
    pub workers: usize,
    pub counts: BulkCounts,
    pub rejected_files: Vec<String>,
    pub outcomes: Vec<FileOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryDetail {
    pub digest: String,
    pub doc_type: String,
    pub region: String,
    pub version: String,
    pub attempt: u32,
    pub success: bool,
    pub rows: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub details: Vec<RetryDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRow {
    pub doc_type: String,
    pub avg_seconds: f64,
    pub min_seconds: f64,
    pub max_seconds: f64,
    pub sample_size: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
    pub regions: i64,
    pub doc_types: i64,
}
