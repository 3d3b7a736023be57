use super::{BodyRows, NormalizeOutput, Normalizer, normalize_answer};
use crate::error::{IngestError, RowErrors, SchemaMappingWarning};
use crate::ingest::layout::{ColumnMapping, Field, LayoutClassifier, PRACTICE_FIELDS, RowKind, Section};
use crate::model::{DocType, NormalizedItems, PracticeItem};

const POSITIONAL_COLUMNS: [Field; 5] = [
    Field::QuestionNumber,
    Field::QuestionText,
    Field::Answer,
    Field::Citation,
    Field::Notes,
];

pub struct PracticeNormalizer {
    classifier: LayoutClassifier,
}

impl PracticeNormalizer {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            classifier: LayoutClassifier::new(PRACTICE_FIELDS)?,
        })
    }
}

/// A first cell naming a group or disclosed practice, on a row with no
/// practice text of its own.
fn group_label(row: &[String]) -> Option<&str> {
    let first = row.first()?.trim();
    let lowered = first.to_lowercase();
    (lowered.contains("group") || lowered.contains("disclosed practice")).then_some(first)
}

fn positional<'r>(row: &'r [String], field: Field) -> Option<&'r str> {
    let column = POSITIONAL_COLUMNS.iter().position(|candidate| *candidate == field)?;
    row.get(column)
        .map(|cell| cell.trim())
        .filter(|cell| !cell.is_empty())
}

impl Normalizer for PracticeNormalizer {
    fn doc_type(&self) -> DocType {
        DocType::AdministrationPractice
    }

    fn classifier(&self) -> &LayoutClassifier {
        &self.classifier
    }

    fn normalize(&self, body: BodyRows<'_>, _version: &str) -> Result<NormalizeOutput, IngestError> {
        let mut items: Vec<PracticeItem> = Vec::new();
        let mut warnings = Vec::new();
        let mut row_errors = RowErrors::default();

        let mut mapping: Option<ColumnMapping> = None;
        let mut group = String::new();

        for (line, row) in body.iter() {
            match self.classifier.classify(row) {
                RowKind::Blank => {}
                RowKind::Section(Section::Labeled(label)) => group = label,
                RowKind::Section(_) => {
                    group = row.first().map(|cell| cell.trim().to_string()).unwrap_or_default();
                }
                RowKind::ColumnHeader(row_mapping) => {
                    if row_mapping.contains(Field::QuestionText) {
                        mapping = Some(row_mapping);
                    } else {
                        warnings.push(SchemaMappingWarning::at_row(
                            line,
                            "header row has no practice text column",
                        ));
                    }
                }
                RowKind::Data => {
                    let cell = |field: Field| match &mapping {
                        Some(mapping) => mapping.value(row, field),
                        None => positional(row, field),
                    };

                    let Some(question_text) = cell(Field::QuestionText) else {
                        if let Some(label) = group_label(row) {
                            group = label.to_string();
                        }
                        continue;
                    };
                    let (answer, compliance_met) = normalize_answer(cell(Field::Answer).unwrap_or_default());

                    items.push(PracticeItem {
                        group_name: cell(Field::Group).unwrap_or(group.as_str()).to_string(),
                        question_number: cell(Field::QuestionNumber)
                            .map(str::to_string)
                            .unwrap_or_else(|| (items.len() + 1).to_string()),
                        question_text: question_text.to_string(),
                        answer,
                        compliance_met,
                        citation: cell(Field::Citation).unwrap_or_default().to_string(),
                        notes: cell(Field::Notes).unwrap_or_default().to_string(),
                    });
                    row_errors.record_ok();
                }
            }
        }

        if mapping.is_none() && !items.is_empty() {
            warnings.push(SchemaMappingWarning::file(
                "no column header found; read rows in positional practice layout",
            ));
        }

        Ok(NormalizeOutput {
            items: NormalizedItems::Practices(items),
            warnings,
            row_errors,
        })
    }
}
