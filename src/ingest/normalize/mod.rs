use crate::error::{IngestError, RowErrors, SchemaMappingWarning};
use crate::ingest::layout::LayoutClassifier;
use crate::model::{DocType, NormalizedItems};

mod compliance;
pub mod definitions;
mod practice;

pub use compliance::ComplianceNormalizer;
pub use definitions::DefinitionsNormalizer;
pub use practice::PracticeNormalizer;

const LEGACY_VERSION_PREFIX: &str = "v2016.";
const FLAG_TRUE: [&str; 5] = ["x", "y", "yes", "1", "true"];
const FLAG_FALSE: [&str; 4] = ["n", "no", "0", "false"];

/// Body rows of one file, starting at the detected data start.
#[derive(Debug, Clone, Copy)]
pub struct BodyRows<'a> {
    pub rows: &'a [Vec<String>],
    /// Index of `rows[0]` in the whole file.
    pub first_row: usize,
}

impl<'a> BodyRows<'a> {
    pub fn new(rows: &'a [Vec<String>], first_row: usize) -> Self {
        let first_row = first_row.min(rows.len());
        Self {
            rows: &rows[first_row..],
            first_row,
        }
    }

    /// Rows paired with their 1-based line number in the file.
    pub fn iter(self) -> impl Iterator<Item = (usize, &'a [String])> + 'a {
        let (rows, first_row) = (self.rows, self.first_row);
        rows.iter()
            .enumerate()
            .map(move |(idx, row)| (first_row + idx + 1, row.as_slice()))
    }
}

#[derive(Debug)]
pub struct NormalizeOutput {
    pub items: NormalizedItems,
    pub warnings: Vec<SchemaMappingWarning>,
    pub row_errors: RowErrors,
}

/// Turns the body rows of one document family into typed items.
pub trait Normalizer: Send + Sync {
    fn doc_type(&self) -> DocType;

    fn classifier(&self) -> &LayoutClassifier;

    fn normalize(&self, body: BodyRows<'_>, version: &str) -> Result<NormalizeOutput, IngestError>;
}

pub fn normalizer_for(doc_type: DocType) -> Result<Box<dyn Normalizer>, IngestError> {
    Ok(match doc_type {
        DocType::Definitions => Box::new(DefinitionsNormalizer::new()?),
        DocType::ComplianceCertificate => Box::new(ComplianceNormalizer::new()?),
        DocType::AdministrationPractice => Box::new(PracticeNormalizer::new()?),
    })
}

pub fn is_legacy_version(version: &str) -> bool {
    version.starts_with(LEGACY_VERSION_PREFIX)
}

/// Loose spreadsheet boolean. `None` for anything outside the accepted
/// spellings, including blanks.
pub fn parse_flag(raw: &str) -> Option<bool> {
    let lowered = raw.trim().to_lowercase();
    if FLAG_TRUE.contains(&lowered.as_str()) {
        Some(true)
    } else if FLAG_FALSE.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Canonical answer text and the compliance flag it implies.
///
/// Affirmative spellings become `"Yes"`/`true`, negative ones and blanks
/// become `"No"`/`false`, `N/A` stays unknown, and anything else is kept
/// verbatim with an unknown flag.
pub fn normalize_answer(raw: &str) -> (String, Option<bool>) {
    let trimmed = raw.trim();
    match trimmed.to_lowercase().as_str() {
        "y" | "yes" | "true" | "x" => ("Yes".to_string(), Some(true)),
        "n" | "no" | "false" | "" => ("No".to_string(), Some(false)),
        "n/a" | "na" => ("N/A".to_string(), None),
        _ => (trimmed.to_string(), None),
    }
}

pub fn parse_amount(raw: &str) -> Result<f64, String> {
    let cleaned = raw
        .trim()
        .chars()
        .filter(|ch| !matches!(ch, '$' | ',' | ' '))
        .collect::<String>();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| format!("unparseable amount {raw:?}"))
}
