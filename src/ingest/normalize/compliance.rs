use super::{BodyRows, NormalizeOutput, Normalizer, normalize_answer};
use crate::error::{IngestError, RowErrors, SchemaMappingWarning};
use crate::ingest::layout::{COMPLIANCE_FIELDS, ColumnMapping, Field, LayoutClassifier, RowKind, Section};
use crate::model::{ComplianceItem, DocType, NormalizedItems};

/// Column order of the older certificate export, which has no header row.
const POSITIONAL_COLUMNS: [Field; 7] = [
    Field::Section,
    Field::Topic,
    Field::QuestionText,
    Field::Answer,
    Field::Citation,
    Field::EffectiveDates,
    Field::Notes,
];

pub struct ComplianceNormalizer {
    classifier: LayoutClassifier,
}

impl ComplianceNormalizer {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            classifier: LayoutClassifier::new(COMPLIANCE_FIELDS)?,
        })
    }
}

fn positional<'r>(row: &'r [String], field: Field) -> Option<&'r str> {
    let column = POSITIONAL_COLUMNS.iter().position(|candidate| *candidate == field)?;
    row.get(column)
        .map(|cell| cell.trim())
        .filter(|cell| !cell.is_empty())
}

fn section_label(section: Section, row: &[String]) -> String {
    match section {
        Section::Labeled(label) => label,
        _ => row
            .first()
            .map(|cell| cell.trim().to_string())
            .unwrap_or_default(),
    }
}

impl Normalizer for ComplianceNormalizer {
    fn doc_type(&self) -> DocType {
        DocType::ComplianceCertificate
    }

    fn classifier(&self) -> &LayoutClassifier {
        &self.classifier
    }

    fn normalize(&self, body: BodyRows<'_>, _version: &str) -> Result<NormalizeOutput, IngestError> {
        let mut items = Vec::new();
        let mut warnings = Vec::new();
        let mut row_errors = RowErrors::default();

        let mut mapping: Option<ColumnMapping> = None;
        let mut section = String::new();

        for (line, row) in body.iter() {
            match self.classifier.classify(row) {
                RowKind::Blank => {}
                RowKind::Section(found) => section = section_label(found, row),
                RowKind::ColumnHeader(row_mapping) => {
                    if row_mapping.contains(Field::QuestionText) || row_mapping.contains(Field::Answer) {
                        mapping = Some(row_mapping);
                    } else {
                        warnings.push(SchemaMappingWarning::at_row(
                            line,
                            "header row names neither a question nor an answer column",
                        ));
                    }
                }
                RowKind::Data => {
                    let cell = |field: Field| match &mapping {
                        Some(mapping) => mapping.value(row, field),
                        None => positional(row, field),
                    };

                    let Some(question_text) = cell(Field::QuestionText) else {
                        continue;
                    };
                    let (answer, compliance_met) = normalize_answer(cell(Field::Answer).unwrap_or_default());
                    let question_number = cell(Field::QuestionNumber)
                        .map(str::to_string)
                        .unwrap_or_else(|| (items.len() + 1).to_string());

                    items.push(ComplianceItem {
                        section: cell(Field::Section).unwrap_or(section.as_str()).to_string(),
                        question_number,
                        topic: cell(Field::Topic).unwrap_or_default().to_string(),
                        question_text: question_text.to_string(),
                        answer,
                        compliance_met,
                        citation: cell(Field::Citation).unwrap_or_default().to_string(),
                        effective_dates: cell(Field::EffectiveDates).unwrap_or_default().to_string(),
                        notes: cell(Field::Notes).unwrap_or_default().to_string(),
                    });
                    row_errors.record_ok();
                }
            }
        }

        if mapping.is_none() && !items.is_empty() {
            warnings.push(SchemaMappingWarning::file(
                "no column header found; read rows in positional certificate layout",
            ));
        }

        Ok(NormalizeOutput {
            items: NormalizedItems::Compliance(items),
            warnings,
            row_errors,
        })
    }
}
