use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use csv::ReaderBuilder;
use tracing::debug;

use crate::error::IngestError;

const ENCODING_SAMPLE_BYTES: usize = 100;
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: [u8; 2] = [0xFF, 0xFE];
const DATE_FORMATS: [&str; 3] = ["%m/%d/%Y", "%Y-%m-%d", "%d/%m/%Y"];

/// Metadata keys holding a date that gets rewritten to ISO form.
const METADATA_DATE_KEYS: [&str; 3] = ["Effective Date", "Published Date", "Revised Date"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
}

impl TextEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf8Bom => "utf-8-sig",
            TextEncoding::Utf16Le => "utf-16-le",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedDocument {
    pub encoding: TextEncoding,
    pub rows: Vec<Vec<String>>,
    pub metadata: BTreeMap<String, String>,
}

pub fn detect_encoding(bytes: &[u8]) -> TextEncoding {
    if bytes.starts_with(&UTF16LE_BOM) {
        return TextEncoding::Utf16Le;
    }
    if bytes.starts_with(&UTF8_BOM) {
        return TextEncoding::Utf8Bom;
    }

    let sample = &bytes[..bytes.len().min(ENCODING_SAMPLE_BYTES)];
    let nulls = sample.iter().filter(|byte| **byte == 0).count();
    // UTF-16LE text in the ASCII range is roughly half null bytes.
    if !sample.is_empty() && nulls * 4 >= sample.len() {
        return TextEncoding::Utf16Le;
    }
    TextEncoding::Utf8
}

pub fn decode_text(bytes: &[u8], path: &Path) -> Result<(String, TextEncoding), IngestError> {
    let encoding = detect_encoding(bytes);
    let decoding_error = |reason: String| IngestError::Decoding {
        path: path.to_path_buf(),
        encoding: encoding.as_str(),
        reason,
    };

    let text = match encoding {
        TextEncoding::Utf16Le => {
            let body = bytes.strip_prefix(&UTF16LE_BOM[..]).unwrap_or(bytes);
            if body.len() % 2 != 0 {
                return Err(decoding_error(format!(
                    "odd byte length {} for a 16-bit encoding",
                    body.len()
                )));
            }
            let units = body
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect::<Vec<_>>();
            String::from_utf16(&units).map_err(|err| decoding_error(err.to_string()))?
        }
        TextEncoding::Utf8Bom => std::str::from_utf8(&bytes[UTF8_BOM.len()..])
            .map_err(|err| decoding_error(err.to_string()))?
            .to_string(),
        TextEncoding::Utf8 => std::str::from_utf8(bytes)
            .map_err(|err| decoding_error(err.to_string()))?
            .to_string(),
    };

    Ok((text, encoding))
}

/// Latin-1 rendering of arbitrary bytes. Only used to show the offending
/// content in diagnostics; never fed to a normalizer.
pub fn latin1_preview(bytes: &[u8], limit: usize) -> String {
    bytes.iter().take(limit).map(|byte| char::from(*byte)).collect()
}

pub fn read_rows(text: &str, path: &Path, encoding: TextEncoding) -> Result<Vec<Vec<String>>, IngestError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| IngestError::Decoding {
            path: path.to_path_buf(),
            encoding: encoding.as_str(),
            reason: err.to_string(),
        })?;
        rows.push(record.iter().map(|cell| cell.trim().to_string()).collect());
    }
    Ok(rows)
}

pub fn decode_document(bytes: &[u8], path: &Path) -> Result<DecodedDocument, IngestError> {
    let (text, encoding) = decode_text(bytes, path).inspect_err(|_| {
        debug!(
            path = %path.display(),
            preview = %latin1_preview(bytes, 64),
            "undecodable leading bytes"
        );
    })?;
    let rows = read_rows(&text, path, encoding)?;
    let mut metadata = extract_metadata(&rows);
    normalize_metadata_dates(&mut metadata);

    debug!(
        path = %path.display(),
        encoding = encoding.as_str(),
        rows = rows.len(),
        metadata_keys = metadata.len(),
        "decoded document"
    );

    Ok(DecodedDocument {
        encoding,
        rows,
        metadata,
    })
}

/// Pairs the first row's labels with the second row's values, ignoring the
/// leading title column. Fewer than two rows yield an empty map.
pub fn extract_metadata(rows: &[Vec<String>]) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let [labels, values, ..] = rows else {
        return metadata;
    };

    for (idx, label) in labels.iter().enumerate().skip(1) {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        let value = values.get(idx).map(|value| value.trim()).unwrap_or_default();
        if !value.is_empty() {
            metadata.insert(label.to_string(), value.to_string());
        }
    }
    metadata
}

pub fn normalize_metadata_dates(metadata: &mut BTreeMap<String, String>) {
    for key in METADATA_DATE_KEYS {
        if let Some(value) = metadata.get_mut(key)
            && let Some(date) = parse_loose_date(value)
        {
            *value = date.format("%Y-%m-%d").to_string();
        }
    }
}

pub fn parse_loose_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

/// Case-insensitive lookup over an ordered list of accepted keys.
pub fn metadata_value<'a>(metadata: &'a BTreeMap<String, String>, aliases: &[&str]) -> Option<&'a str> {
    aliases.iter().find_map(|alias| {
        metadata
            .iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(alias))
            .map(|(_, value)| value.as_str())
    })
}
