//! Row classification and header-to-field mapping for spreadsheet exports.
//!
//! Every document family shares the same shape: a few metadata rows, then a
//! body where section labels, column-header rows and data rows interleave.
//! [`LayoutClassifier`] tells them apart and [`ColumnMapper`] turns a header
//! row into a [`ColumnMapping`] over canonical [`Field`]s.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use tracing::trace;

use crate::error::IngestError;

/// The earliest row that may hold data; rows before it are metadata.
pub const DATA_START_MIN_OFFSET: usize = 3;

const METADATA_KEYWORDS: [&str; 6] = [
    "state",
    "version",
    "library",
    "section",
    "tax admin",
    "certificate",
];
const MAX_HEADER_CELL_CHARS: usize = 40;
const OVERLAP_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Code,
    Description,
    Treatment,
    Reference,
    Comment,
    Taxable,
    Exempt,
    Included,
    Excluded,
    Threshold,
    Group,
    Section,
    QuestionNumber,
    Topic,
    QuestionText,
    Answer,
    Citation,
    EffectiveDates,
    Notes,
}

/// A canonical field and the header spellings that name it, most specific
/// first. Table order decides ties between fields.
pub type FieldAliases = (Field, &'static [&'static str]);

pub const DEFINITION_FIELDS: &[FieldAliases] = &[
    (Field::Code, &["code", "item number", "item no", "item #", "item", "number"]),
    (Field::Description, &["description", "desc", "definition"]),
    (Field::Treatment, &["treatment", "taxability", "tax treatment", "status"]),
    (Field::Reference, &["reference", "statute", "citation", "ref"]),
    (Field::Comment, &["comment", "comments", "notes", "note", "remarks"]),
    (Field::Taxable, &["taxable"]),
    (Field::Exempt, &["exempt", "exemption"]),
    (Field::Included, &["included", "include"]),
    (Field::Excluded, &["excluded", "exclude"]),
    (Field::Threshold, &["threshold", "limit", "amount"]),
    (Field::Group, &["group", "category"]),
];

pub const COMPLIANCE_FIELDS: &[FieldAliases] = &[
    (Field::Section, &["section"]),
    (
        Field::QuestionNumber,
        &["question number", "question no", "question #", "question id", "q num", "number", "id"],
    ),
    (Field::Topic, &["topic", "subject"]),
    (Field::QuestionText, &["question text", "question", "description", "requirement"]),
    (Field::Answer, &["answer", "response", "compliant", "y/n"]),
    (Field::Citation, &["citation", "statute", "reference", "cite"]),
    (Field::EffectiveDates, &["effective dates", "effective date", "dates"]),
    (Field::Notes, &["notes", "note", "comments", "comment"]),
];

pub const PRACTICE_FIELDS: &[FieldAliases] = &[
    (Field::Group, &["group", "group name", "category"]),
    (
        Field::QuestionNumber,
        &["practice number", "practice no", "question number", "number", "id", "#"],
    ),
    (Field::QuestionText, &["practice", "description", "question text", "question"]),
    (Field::Answer, &["answer", "response"]),
    (Field::Citation, &["citation", "statute", "reference"]),
    (Field::Notes, &["notes", "note", "comments", "comment"]),
];

/// One matching strategy for a header cell.
pub trait HeaderMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// First field outside `taken` that accepts `cell`.
    fn match_cell(&self, cell: &str, fields: &[FieldAliases], taken: &BTreeSet<Field>) -> Option<Field>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatcher;

impl HeaderMatcher for ExactMatcher {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn match_cell(&self, cell: &str, fields: &[FieldAliases], taken: &BTreeSet<Field>) -> Option<Field> {
        let key = header_key(cell);
        first_untaken(fields, taken, |alias| key == *alias)
    }
}

/// Either string contains the other. Short spellings never take part.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainmentMatcher;

impl HeaderMatcher for ContainmentMatcher {
    fn name(&self) -> &'static str {
        "containment"
    }

    fn match_cell(&self, cell: &str, fields: &[FieldAliases], taken: &BTreeSet<Field>) -> Option<Field> {
        let key = header_key(cell);
        if key.chars().count() < 3 || key.chars().count() > MAX_HEADER_CELL_CHARS {
            return None;
        }
        first_untaken(fields, taken, |alias| {
            alias.len() >= 3 && (key.contains(alias) || alias.contains(key.as_str()))
        })
    }
}

/// Shared-character ratio over the shorter of the two alphanumeric forms.
#[derive(Debug, Clone, Copy)]
pub struct OverlapMatcher {
    pub threshold: f64,
}

impl Default for OverlapMatcher {
    fn default() -> Self {
        Self {
            threshold: OVERLAP_THRESHOLD,
        }
    }
}

impl HeaderMatcher for OverlapMatcher {
    fn name(&self) -> &'static str {
        "overlap"
    }

    fn match_cell(&self, cell: &str, fields: &[FieldAliases], taken: &BTreeSet<Field>) -> Option<Field> {
        let key = alphanumeric(cell);
        if key.is_empty() || key.chars().count() > MAX_HEADER_CELL_CHARS {
            return None;
        }
        first_untaken(fields, taken, |alias| {
            let alias = alphanumeric(alias);
            alias.chars().count() >= 4 && overlap_ratio(&key, &alias) >= self.threshold
        })
    }
}

pub fn overlap_ratio(left: &str, right: &str) -> f64 {
    let shorter = left.chars().count().min(right.chars().count());
    if shorter == 0 {
        return 0.0;
    }
    let left_set = left.chars().collect::<BTreeSet<_>>();
    let right_set = right.chars().collect::<BTreeSet<_>>();
    left_set.intersection(&right_set).count() as f64 / shorter as f64
}

fn first_untaken(
    fields: &[FieldAliases],
    taken: &BTreeSet<Field>,
    accepts: impl Fn(&&str) -> bool,
) -> Option<Field> {
    fields
        .iter()
        .filter(|(field, _)| !taken.contains(field))
        .find(|(_, aliases)| aliases.iter().any(&accepts))
        .map(|(field, _)| *field)
}

fn header_key(cell: &str) -> String {
    cell.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches([':', '*', '?'])
        .to_lowercase()
}

fn alphanumeric(text: &str) -> String {
    text.chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Column positions for the canonical fields of one header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    columns: BTreeMap<Field, usize>,
    exact_hits: usize,
}

impl ColumnMapping {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, field: Field) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    pub fn contains(&self, field: Field) -> bool {
        self.columns.contains_key(&field)
    }

    /// Trimmed, non-empty cell for `field` in a data row.
    pub fn value<'r>(&self, row: &'r [String], field: Field) -> Option<&'r str> {
        let column = self.column(field)?;
        row.get(column)
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
    }

    /// A row is a column header when at least two columns map and one of
    /// them matched a spelling exactly.
    pub fn is_column_header(&self) -> bool {
        self.len() >= 2 && self.exact_hits >= 1
    }
}

/// Runs its matchers as successive passes over the whole row, so an exact
/// hit anywhere claims its field before any looser strategy sees it.
pub struct ColumnMapper {
    tiers: Vec<Box<dyn HeaderMatcher>>,
}

impl Default for ColumnMapper {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ExactMatcher),
            Box::new(ContainmentMatcher),
            Box::new(OverlapMatcher::default()),
        ])
    }
}

impl ColumnMapper {
    /// The first tier counts as the exact tier.
    pub fn new(tiers: Vec<Box<dyn HeaderMatcher>>) -> Self {
        Self { tiers }
    }

    pub fn map_row(&self, row: &[String], fields: &[FieldAliases], skip_label: bool) -> ColumnMapping {
        let mut mapping = ColumnMapping::default();
        let mut taken = BTreeSet::new();
        let mut claimed_columns = BTreeSet::new();
        let first_column = usize::from(skip_label);

        for (tier_idx, tier) in self.tiers.iter().enumerate() {
            for (column, cell) in row.iter().enumerate().skip(first_column) {
                if cell.trim().is_empty() || claimed_columns.contains(&column) {
                    continue;
                }
                if let Some(field) = tier.match_cell(cell, fields, &taken) {
                    trace!(cell = %cell, field = ?field, tier = tier.name(), "mapped header cell");
                    taken.insert(field);
                    claimed_columns.insert(column);
                    mapping.columns.insert(field, column);
                    if tier_idx == 0 {
                        mapping.exact_hits += 1;
                    }
                }
            }
        }
        mapping
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Administrative,
    Product,
    Holiday,
    /// A numbered or named grouping such as "Section 2" or "Taxable".
    Labeled(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKind {
    Blank,
    Section(Section),
    ColumnHeader(ColumnMapping),
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStart {
    pub index: usize,
    pub fallback_used: bool,
}

pub struct LayoutClassifier {
    fields: &'static [FieldAliases],
    mapper: ColumnMapper,
    labeled_section: Regex,
    category_label: Regex,
    banner: Regex,
}

impl LayoutClassifier {
    pub fn new(fields: &'static [FieldAliases]) -> Result<Self, IngestError> {
        Ok(Self {
            fields,
            mapper: ColumnMapper::default(),
            labeled_section: Regex::new(r"(?i)^((section|part|group)\s+\d+|disclosed practice)")?,
            category_label: Regex::new(r"(?i)^(taxable|exempt|included|excluded)$")?,
            banner: Regex::new(r"(?i)^(library|definition|certificate)")?,
        })
    }

    pub fn map_columns(&self, row: &[String], skip_label: bool) -> ColumnMapping {
        self.mapper.map_row(row, self.fields, skip_label)
    }

    /// Section introduced by this row, if any. Named definition sections
    /// may carry column labels on the same row; labeled sections may carry
    /// at most a title next to the label.
    pub fn section_of(&self, row: &[String]) -> Option<Section> {
        let first = row.first().map(|cell| cell.trim()).unwrap_or_default();
        if first.is_empty() {
            return None;
        }

        let lowered = first.to_lowercase();
        if lowered.contains("administrative definition") {
            return Some(Section::Administrative);
        }
        if lowered.contains("product definition") || lowered.contains("product/service definition") {
            return Some(Section::Product);
        }
        if lowered.contains("sales tax holiday") {
            return Some(Section::Holiday);
        }

        let filled = row.iter().filter(|cell| !cell.trim().is_empty()).count();
        if filled <= 2 && (self.labeled_section.is_match(first) || self.category_label.is_match(first)) {
            let label = row
                .iter()
                .map(|cell| cell.trim())
                .filter(|cell| !cell.is_empty())
                .collect::<Vec<_>>()
                .join(" - ");
            return Some(Section::Labeled(label));
        }
        None
    }

    /// Code-keyed data row: a numeric code, or a short code containing a
    /// digit, that is not a section or banner label.
    pub fn is_code_row(&self, row: &[String]) -> bool {
        if row.len() < 2 {
            return false;
        }
        let first = row[0].trim();
        if first.is_empty() || self.banner.is_match(first) || self.category_label.is_match(first) {
            return false;
        }
        if self.section_of(row).is_some() {
            return false;
        }
        if first.chars().all(|ch| ch.is_ascii_digit()) {
            return true;
        }
        first.chars().count() <= 15 && first.chars().any(|ch| ch.is_ascii_digit())
    }

    pub fn classify(&self, row: &[String]) -> RowKind {
        if is_blank(row) {
            return RowKind::Blank;
        }
        if let Some(section) = self.section_of(row) {
            return RowKind::Section(section);
        }
        if self.is_code_row(row) {
            return RowKind::Data;
        }
        let mapping = self.map_columns(row, false);
        if mapping.is_column_header() {
            return RowKind::ColumnHeader(mapping);
        }
        RowKind::Data
    }

    /// First body row at or after [`DATA_START_MIN_OFFSET`]. Section and
    /// column-header rows start the body even when they mention a metadata
    /// keyword.
    pub fn find_data_start(&self, rows: &[Vec<String>], fallback: usize) -> DataStart {
        for (idx, row) in rows.iter().enumerate().skip(DATA_START_MIN_OFFSET) {
            if is_blank(row) {
                continue;
            }
            if self.section_of(row).is_some() || self.map_columns(row, false).is_column_header() {
                return DataStart {
                    index: idx,
                    fallback_used: false,
                };
            }
            if row.len() >= 3 && !mentions_metadata_keyword(row) {
                return DataStart {
                    index: idx,
                    fallback_used: false,
                };
            }
        }

        DataStart {
            index: fallback.min(rows.len()),
            fallback_used: true,
        }
    }
}

pub fn is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

fn mentions_metadata_keyword(row: &[String]) -> bool {
    row.iter().take(3).any(|cell| {
        let lowered = cell.to_lowercase();
        METADATA_KEYWORDS
            .iter()
            .any(|keyword| lowered.contains(keyword))
    })
}
