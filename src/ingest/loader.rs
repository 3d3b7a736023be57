use std::collections::BTreeMap;
use std::fs;

use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::error::IngestError;
use crate::ingest::decode::{self, DecodedDocument, metadata_value, parse_loose_date};
use crate::ingest::normalize::{BodyRows, normalizer_for};
use crate::model::{DefinitionCategory, NormalizedItems, SourceFile};
use crate::store::{CopyValue, StagingBuffer, copy_in};
use crate::util::now_utc_string;

const DEFINITION_COLUMNS: &[&str] = &[
    "document_version_id",
    "category",
    "code",
    "group_name",
    "description",
    "taxable",
    "exempt",
    "included",
    "excluded",
    "threshold",
    "reference",
    "comment",
];
const COMPLIANCE_COLUMNS: &[&str] = &[
    "document_version_id",
    "section",
    "question_number",
    "topic",
    "question_text",
    "answer",
    "compliance_met",
    "citation",
    "effective_dates",
    "notes",
];
const PRACTICE_COLUMNS: &[&str] = &[
    "document_version_id",
    "group_name",
    "question_number",
    "question_text",
    "answer",
    "compliance_met",
    "citation",
    "notes",
];

const EFFECTIVE_DATE_KEYS: [&str; 2] = ["Effective Date", "Effective"];
const VERSION_KEYS: [&str; 2] = ["Version", "Version Number"];

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub document_version_id: i64,
    pub rows: usize,
    pub effective_date: NaiveDate,
    pub row_errors: usize,
    pub warnings: Vec<String>,
}

/// Loads one file as a single unit: the version row and all of its items
/// commit together or not at all.
pub struct DocumentLoader<'a> {
    config: &'a LoaderConfig,
}

impl<'a> DocumentLoader<'a> {
    pub fn new(config: &'a LoaderConfig) -> Self {
        Self { config }
    }

    pub fn load(
        &self,
        connection: &mut Connection,
        file: &SourceFile,
        digest: Option<&str>,
    ) -> Result<LoadOutcome, IngestError> {
        self.load_inner(connection, file, digest)
            .map_err(|err| err.wrap_load(file.doc_type, &file.region))
    }

    fn load_inner(
        &self,
        connection: &mut Connection,
        file: &SourceFile,
        digest: Option<&str>,
    ) -> Result<LoadOutcome, IngestError> {
        let bytes = fs::read(&file.path)?;
        let document = decode::decode_document(&bytes, &file.path)?;
        let normalizer = normalizer_for(file.doc_type)?;

        let data_start = normalizer
            .classifier()
            .find_data_start(&document.rows, self.config.data_start_fallback);
        debug!(
            doc_type = %normalizer.doc_type(),
            data_start = data_start.index,
            fallback = data_start.fallback_used,
            "resolved data start"
        );
        let mut warnings = Vec::new();
        if data_start.fallback_used {
            warnings.push(format!(
                "no data start found; assumed row {}",
                data_start.index + 1
            ));
        }

        let version = resolve_version(file, &document.metadata, &mut warnings);
        let effective_date = resolve_effective_date(file, &document.metadata, &mut warnings);
        let metadata_json = metadata_json(file, &document, data_start.index)?;

        let tx = connection.transaction()?;
        let document_version_id = insert_document_version(
            &tx,
            file,
            &version,
            effective_date,
            &metadata_json,
            digest,
        )?;

        let output = normalizer.normalize(BodyRows::new(&document.rows, data_start.index), &version)?;
        for error in output.row_errors.errors() {
            debug!(path = %file.path.display(), error = %error, "row rejected");
        }
        output.row_errors.check_threshold(self.config.error_threshold)?;
        warnings.extend(output.warnings.iter().map(ToString::to_string));

        let rows = insert_items(&tx, document_version_id, &output.items)?;
        tx.commit()?;

        for warning in &warnings {
            warn!(path = %file.path.display(), warning = %warning, "layout warning");
        }
        info!(
            doc_type = %file.doc_type,
            region = %file.region,
            version = %version,
            document_version_id,
            rows,
            attempted = output.row_errors.attempted(),
            row_errors = output.row_errors.errors().len(),
            "loaded document"
        );

        Ok(LoadOutcome {
            document_version_id,
            rows,
            effective_date,
            row_errors: output.row_errors.errors().len(),
            warnings,
        })
    }
}

/// The version in the file name wins; the metadata row is only consulted
/// to report a disagreement.
fn resolve_version(file: &SourceFile, metadata: &BTreeMap<String, String>, warnings: &mut Vec<String>) -> String {
    if let Some(declared) = metadata_value(metadata, &VERSION_KEYS)
        && !declared.eq_ignore_ascii_case(&file.version)
    {
        warnings.push(format!(
            "metadata version {declared} differs from file name version {}",
            file.version
        ));
    }
    file.version.clone()
}

/// Capture timestamp from the file name, then the metadata effective date,
/// then today's date.
pub fn resolve_effective_date(
    file: &SourceFile,
    metadata: &BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) -> NaiveDate {
    if let Some(captured_at) = file.captured_at {
        return captured_at.date();
    }
    if let Some(date) = metadata_value(metadata, &EFFECTIVE_DATE_KEYS).and_then(parse_loose_date) {
        return date;
    }
    let today = Local::now().date_naive();
    warnings.push(format!("no usable capture timestamp or effective date; using {today}"));
    today
}

fn metadata_json(file: &SourceFile, document: &DecodedDocument, data_start: usize) -> Result<String, IngestError> {
    let mut metadata = serde_json::Map::new();
    for (key, value) in &document.metadata {
        metadata.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    metadata.insert(
        "_source_file".to_string(),
        serde_json::Value::String(
            file.path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
    );
    metadata.insert(
        "_encoding".to_string(),
        serde_json::Value::String(document.encoding.as_str().to_string()),
    );
    metadata.insert("_data_start".to_string(), serde_json::Value::from(data_start));
    Ok(serde_json::to_string(&metadata)?)
}

fn insert_document_version(
    tx: &Transaction<'_>,
    file: &SourceFile,
    version: &str,
    effective_date: NaiveDate,
    metadata_json: &str,
    digest: Option<&str>,
) -> Result<i64, IngestError> {
    let id = tx
        .query_row(
            "INSERT INTO document_versions(
               region, doc_type, version, effective_date, metadata, source_digest, loaded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             RETURNING document_version_id",
            params![
                file.region,
                file.doc_type.as_str(),
                version,
                effective_date.format("%Y-%m-%d").to_string(),
                metadata_json,
                digest,
                now_utc_string(),
            ],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    id.ok_or_else(|| IngestError::Insert("document version insert returned no identifier".to_string()))
}

fn insert_items(tx: &Transaction<'_>, document_version_id: i64, items: &NormalizedItems) -> Result<usize, IngestError> {
    debug!(
        document_version_id,
        items = items.len(),
        admin = items.definitions_in(DefinitionCategory::Admin),
        product = items.definitions_in(DefinitionCategory::Product),
        holiday = items.definitions_in(DefinitionCategory::Holiday),
        "staging items"
    );
    let buffer = match items {
        NormalizedItems::Definitions(items) => {
            let mut buffer = StagingBuffer::new("definition_items", DEFINITION_COLUMNS);
            for item in items {
                buffer.push_row(&[
                    CopyValue::Int(document_version_id),
                    CopyValue::Text(item.category.as_str()),
                    CopyValue::Text(&item.code),
                    CopyValue::from(item.group_name.as_deref()),
                    CopyValue::Text(&item.description),
                    CopyValue::from(item.taxable),
                    CopyValue::from(item.exempt),
                    CopyValue::from(item.included),
                    CopyValue::from(item.excluded),
                    CopyValue::from(item.threshold),
                    CopyValue::from(item.reference.as_deref()),
                    CopyValue::from(item.comment.as_deref()),
                ])?;
            }
            buffer
        }
        NormalizedItems::Compliance(items) => {
            let mut buffer = StagingBuffer::new("compliance_items", COMPLIANCE_COLUMNS);
            for item in items {
                buffer.push_row(&[
                    CopyValue::Int(document_version_id),
                    CopyValue::Text(&item.section),
                    CopyValue::Text(&item.question_number),
                    CopyValue::Text(&item.topic),
                    CopyValue::Text(&item.question_text),
                    CopyValue::Text(&item.answer),
                    CopyValue::from(item.compliance_met),
                    CopyValue::Text(&item.citation),
                    CopyValue::Text(&item.effective_dates),
                    CopyValue::Text(&item.notes),
                ])?;
            }
            buffer
        }
        NormalizedItems::Practices(items) => {
            let mut buffer = StagingBuffer::new("practice_items", PRACTICE_COLUMNS);
            for item in items {
                buffer.push_row(&[
                    CopyValue::Int(document_version_id),
                    CopyValue::Text(&item.group_name),
                    CopyValue::Text(&item.question_number),
                    CopyValue::Text(&item.question_text),
                    CopyValue::Text(&item.answer),
                    CopyValue::from(item.compliance_met),
                    CopyValue::Text(&item.citation),
                    CopyValue::Text(&item.notes),
                ])?;
            }
            buffer
        }
    };

    copy_in(tx, &buffer)
}
