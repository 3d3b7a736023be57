use std::path::Path;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::error::IngestError;
use crate::model::{DocType, SourceFile};

const CAPTURE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";
pub const REGION_DIR_PREFIXES: [&str; 2] = ["region=", "state="];

/// Parses `{doc}_{REGION}_{vYYYY.N}_{YYYYMMDDThhmmss}.csv` names. The
/// timestamp part is optional.
pub struct SourceFileParser {
    pattern: Regex,
}

impl SourceFileParser {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            pattern: Regex::new(
                r"^(?P<doc>[A-Za-z]+)_(?P<region>[A-Za-z0-9]+)_(?P<version>v\d{4}\.\d+)(?:_(?P<captured>[^.]+))?$",
            )?,
        })
    }

    /// `doc_type` overrides whatever the partition folder or file prefix
    /// says.
    pub fn parse(&self, path: &Path, doc_type: Option<DocType>) -> Result<SourceFile, IngestError> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| IngestError::InvalidFileName(path.display().to_string()))?;
        let captures = self
            .pattern
            .captures(stem)
            .ok_or_else(|| IngestError::InvalidFileName(path.display().to_string()))?;

        let doc_type = doc_type
            .or_else(|| partition_doc_type(path))
            .or_else(|| captures["doc"].parse::<DocType>().ok())
            .ok_or_else(|| IngestError::InvalidFileName(path.display().to_string()))?;

        let captured_at = captures
            .name("captured")
            .and_then(|raw| NaiveDateTime::parse_from_str(raw.as_str(), CAPTURE_TIMESTAMP_FORMAT).ok());

        Ok(SourceFile {
            path: path.to_path_buf(),
            doc_type,
            region: captures["region"].to_ascii_uppercase(),
            version: captures["version"].to_string(),
            captured_at,
        })
    }
}

/// `{root}/{partition}/region=XX/file.csv` gives the document type by its
/// partition folder.
fn partition_doc_type(path: &Path) -> Option<DocType> {
    let region_dir = path.parent()?;
    let region_name = region_dir.file_name()?.to_str()?;
    if region_dir_code(region_name).is_none() {
        return None;
    }
    let partition = region_dir.parent()?.file_name()?.to_str()?;
    DocType::from_partition(partition)
}

/// Region code from a `region=XX` (or older `state=XX`) folder name.
pub fn region_dir_code(name: &str) -> Option<&str> {
    REGION_DIR_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .filter(|code| !code.is_empty())
}
