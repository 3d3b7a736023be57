use std::ops::RangeInclusive;

use tracing::debug;

use super::{BodyRows, NormalizeOutput, Normalizer, is_legacy_version, parse_amount, parse_flag};
use crate::error::{IngestError, RowErrors, SchemaMappingWarning};
use crate::ingest::layout::{
    ColumnMapping, DEFINITION_FIELDS, Field, LayoutClassifier, RowKind, Section,
};
use crate::model::{DefinitionCategory, DefinitionItem, DocType, NormalizedItems};

const ADMIN_CODES: RangeInclusive<u32> = 10000..=19999;
const HOLIDAY_CODES: [u32; 15] = [
    20060, 20070, 20080, 20090, 20100, 20105, 20110, 20120, 20130, 20140, 20150, 20160, 20170,
    20180, 20190,
];

/// Category of a definition in the older flat layout, where only the code
/// tells the families apart.
pub fn legacy_category(code: &str) -> DefinitionCategory {
    match code.trim().parse::<u32>() {
        Ok(number) if ADMIN_CODES.contains(&number) => DefinitionCategory::Admin,
        Ok(number) if HOLIDAY_CODES.contains(&number) => DefinitionCategory::Holiday,
        _ => DefinitionCategory::Product,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Treatment {
    pub taxable: Option<bool>,
    pub exempt: Option<bool>,
    pub included: Option<bool>,
    pub excluded: Option<bool>,
}

/// Treatment column text to boolean pairs. Each recognized value sets both
/// halves of its pair; unrecognized text yields `None`.
pub fn translate_treatment(raw: &str) -> Option<Treatment> {
    let lowered = raw.trim().to_lowercase();
    let nontaxable = lowered.starts_with("non") && lowered.contains("taxable");

    if nontaxable || lowered.contains("exempt") || lowered == "e" {
        Some(Treatment {
            taxable: Some(false),
            exempt: Some(true),
            ..Treatment::default()
        })
    } else if lowered.contains("taxable") || lowered == "t" {
        Some(Treatment {
            taxable: Some(true),
            exempt: Some(false),
            ..Treatment::default()
        })
    } else if lowered.contains("excluded") || lowered == "exc" {
        Some(Treatment {
            included: Some(false),
            excluded: Some(true),
            ..Treatment::default()
        })
    } else if lowered.contains("included") || lowered == "i" || lowered == "inc" {
        Some(Treatment {
            included: Some(true),
            excluded: Some(false),
            ..Treatment::default()
        })
    } else {
        None
    }
}

pub struct DefinitionsNormalizer {
    classifier: LayoutClassifier,
}

impl DefinitionsNormalizer {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            classifier: LayoutClassifier::new(DEFINITION_FIELDS)?,
        })
    }

    fn parse_item(
        &self,
        row: &[String],
        mapping: &ColumnMapping,
        category: DefinitionCategory,
        group: Option<&str>,
    ) -> Result<Option<DefinitionItem>, String> {
        let code = mapping
            .value(row, Field::Code)
            .or_else(|| row.first().map(|cell| cell.trim()))
            .unwrap_or_default();
        let Some(description) = mapping.value(row, Field::Description) else {
            return Ok(None);
        };

        let mut treatment = match mapping.value(row, Field::Treatment) {
            Some(raw) => translate_treatment(raw)
                .ok_or_else(|| format!("code {code}: unrecognized treatment {raw:?}"))?,
            None => Treatment::default(),
        };

        for (field, slot) in [
            (Field::Taxable, &mut treatment.taxable),
            (Field::Exempt, &mut treatment.exempt),
            (Field::Included, &mut treatment.included),
            (Field::Excluded, &mut treatment.excluded),
        ] {
            if let Some(raw) = mapping.value(row, field) {
                let flag = parse_flag(raw)
                    .ok_or_else(|| format!("code {code}: unrecognized {field:?} flag {raw:?}"))?;
                slot.get_or_insert(flag);
            }
        }

        if treatment.taxable == Some(true) && treatment.exempt == Some(true) {
            return Err(format!("code {code}: marked both taxable and exempt"));
        }
        if treatment.included == Some(true) && treatment.excluded == Some(true) {
            return Err(format!("code {code}: marked both included and excluded"));
        }

        let threshold = mapping
            .value(row, Field::Threshold)
            .map(parse_amount)
            .transpose()
            .map_err(|err| format!("code {code}: {err}"))?;

        Ok(Some(DefinitionItem {
            category,
            code: code.to_string(),
            group_name: mapping
                .value(row, Field::Group)
                .or(group)
                .map(str::to_string),
            description: description.to_string(),
            taxable: treatment.taxable,
            exempt: treatment.exempt,
            included: treatment.included,
            excluded: treatment.excluded,
            threshold,
            reference: mapping.value(row, Field::Reference).map(str::to_string),
            comment: mapping.value(row, Field::Comment).map(str::to_string),
        }))
    }
}

impl Normalizer for DefinitionsNormalizer {
    fn doc_type(&self) -> DocType {
        DocType::Definitions
    }

    fn classifier(&self) -> &LayoutClassifier {
        &self.classifier
    }

    fn normalize(&self, body: BodyRows<'_>, version: &str) -> Result<NormalizeOutput, IngestError> {
        let legacy = is_legacy_version(version);
        let mut items = Vec::new();
        let mut warnings = Vec::new();
        let mut row_errors = RowErrors::default();

        let mut mapping = ColumnMapping::default();
        let mut section_category: Option<DefinitionCategory> = None;
        let mut group: Option<String> = None;
        let mut unmapped_rows = 0_usize;

        for (line, row) in body.iter() {
            match self.classifier.classify(row) {
                RowKind::Blank => {}
                RowKind::Section(section) => {
                    let row_mapping = self.classifier.map_columns(row, true);
                    let category = match section {
                        Section::Administrative => DefinitionCategory::Admin,
                        Section::Product => DefinitionCategory::Product,
                        Section::Holiday => DefinitionCategory::Holiday,
                        Section::Labeled(label) => {
                            group = Some(label);
                            if !row_mapping.is_empty() {
                                mapping = row_mapping;
                            }
                            continue;
                        }
                    };
                    if row_mapping.is_empty() {
                        warnings.push(SchemaMappingWarning::at_row(
                            line,
                            format!("{} section header has no column labels", category.as_str()),
                        ));
                    }
                    section_category = Some(category);
                    group = None;
                    mapping = row_mapping;
                }
                RowKind::ColumnHeader(row_mapping) => mapping = row_mapping,
                RowKind::Data => {
                    if !self.classifier.is_code_row(row) {
                        continue;
                    }
                    if mapping.is_empty() {
                        unmapped_rows += 1;
                        continue;
                    }

                    let code = mapping
                        .value(row, Field::Code)
                        .or_else(|| row.first().map(|cell| cell.trim()))
                        .unwrap_or_default();
                    let category = if legacy {
                        legacy_category(code)
                    } else {
                        section_category.unwrap_or_else(|| legacy_category(code))
                    };

                    match self.parse_item(row, &mapping, category, group.as_deref()) {
                        Ok(Some(item)) => {
                            row_errors.record_ok();
                            items.push(item);
                        }
                        Ok(None) => debug!(line, code, "definition row without description skipped"),
                        Err(message) => row_errors.record_err(line, message),
                    }
                }
            }
        }

        if unmapped_rows > 0 {
            warnings.push(SchemaMappingWarning::file(format!(
                "{unmapped_rows} definition rows appeared before any column header and were skipped"
            )));
        }

        Ok(NormalizeOutput {
            items: NormalizedItems::Definitions(items),
            warnings,
            row_errors,
        })
    }
}
