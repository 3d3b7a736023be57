use std::thread;

use glob::Pattern;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::error::IngestError;
use crate::ingest::ledger;
use crate::ingest::loader::DocumentLoader;
use crate::ingest::scheduler::tracked_load;
use crate::ingest::source_file::{REGION_DIR_PREFIXES, SourceFileParser};
use crate::model::{DocType, RetryDetail, RetryReport, SourceFile, StatusRecord};
use crate::store::ConnectionFactory;

const MAX_BACKOFF_DOUBLINGS: u32 = 10;

/// Re-runs failed loads that are still under the attempt ceiling. The file
/// is found again by partition, region and version, and only accepted when
/// its digest matches the ledger record.
pub struct RecoveryCoordinator<'a, F: ConnectionFactory> {
    config: &'a LoaderConfig,
    factory: &'a F,
}

impl<'a, F: ConnectionFactory> RecoveryCoordinator<'a, F> {
    pub fn new(config: &'a LoaderConfig, factory: &'a F) -> Self {
        Self { config, factory }
    }

    pub fn retry_failed(&self, ceiling: u32) -> Result<RetryReport, IngestError> {
        let mut connection = self.factory.connect()?;
        let parser = SourceFileParser::new()?;
        let loader = DocumentLoader::new(self.config);
        let mut report = RetryReport::default();

        for record in ledger::failed_loads(&connection, None)? {
            if record.attempts >= ceiling {
                let exhausted = IngestError::RetryExhausted {
                    digest: record.digest.clone(),
                    attempts: record.attempts,
                    ceiling,
                };
                debug!(error = %exhausted, "not retrying");
                continue;
            }

            let attempt = record.attempts + 1;
            report.attempted += 1;
            self.backoff(record.attempts);

            let file = match self.locate_file(&parser, &record) {
                Ok(file) => file,
                Err(err) => {
                    warn!(digest = %record.digest, error = %err, "retry skipped");
                    report.failed += 1;
                    report.details.push(detail(&record, attempt, Err(&err)));
                    continue;
                }
            };

            info!(
                path = %file.path.display(),
                attempt,
                ceiling,
                "retrying failed load"
            );
            let label = format!("retry {attempt}");
            match tracked_load(&mut connection, &loader, &file, &record.digest, Some(&label)) {
                Ok(outcome) => {
                    report.succeeded += 1;
                    report.details.push(detail(&record, attempt, Ok(outcome.rows)));
                }
                Err(err) => {
                    warn!(path = %file.path.display(), attempt, error = %err, "retry failed");
                    report.failed += 1;
                    report.details.push(detail(&record, attempt, Err(&err)));
                }
            }
        }

        Ok(report)
    }

    /// Finds the file for a ledger record by glob, verifying its digest.
    pub fn locate_file(&self, parser: &SourceFileParser, record: &StatusRecord) -> Result<SourceFile, IngestError> {
        let not_found = |doc_type: DocType| IngestError::FileNotFoundForRetry {
            doc_type,
            region: record.region.clone(),
            version: record.version.clone(),
        };
        let doc_type = record
            .doc_type
            .parse::<DocType>()
            .map_err(IngestError::InvalidFileName)?;

        let partition = self.config.data_root.join(doc_type.partition());
        for prefix in REGION_DIR_PREFIXES {
            let pattern = format!(
                "{}/{}/*_{}*.csv",
                Pattern::escape(&partition.display().to_string()),
                any_case(&format!("{prefix}{}", record.region)),
                Pattern::escape(&record.version)
            );
            let entries = glob::glob(&pattern)
                .map_err(|err| IngestError::InvalidPattern(format!("{pattern}: {err}")))?;

            for path in entries.flatten() {
                let matches = ledger::file_digest(&path)
                    .map(|digest| digest == record.digest)
                    .unwrap_or(false);
                if matches {
                    return parser.parse(&path, Some(doc_type));
                }
            }
        }

        Err(not_found(doc_type))
    }

    fn backoff(&self, previous_attempts: u32) {
        if self.config.retry_backoff.is_zero() {
            return;
        }
        let factor = 2_u32.saturating_pow(previous_attempts.min(MAX_BACKOFF_DOUBLINGS));
        let delay = self.config.retry_backoff.saturating_mul(factor);
        debug!(delay_ms = delay.as_millis() as u64, "retry backoff");
        thread::sleep(delay);
    }
}

/// Glob for `text` in any letter case. Discovery uppercases region codes,
/// so `region=ar` on disk is stored as `AR`.
fn any_case(text: &str) -> String {
    text.chars()
        .map(|ch| {
            if ch.is_ascii_alphabetic() {
                format!("[{}{}]", ch.to_ascii_lowercase(), ch.to_ascii_uppercase())
            } else {
                Pattern::escape(&ch.to_string())
            }
        })
        .collect()
}

fn detail(record: &StatusRecord, attempt: u32, result: Result<usize, &IngestError>) -> RetryDetail {
    let (success, rows, error) = match result {
        Ok(rows) => (true, Some(rows), None),
        Err(err) => (false, None, Some(err.to_string())),
    };
    RetryDetail {
        digest: record.digest.clone(),
        doc_type: record.doc_type.clone(),
        region: record.region.clone(),
        version: record.version.clone(),
        attempt,
        success,
        rows,
        error,
    }
}
