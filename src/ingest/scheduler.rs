use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use glob::Pattern;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::config::LoaderConfig;
use crate::error::IngestError;
use crate::ingest::ledger::{self, StatusUpdate};
use crate::ingest::loader::{DocumentLoader, LoadOutcome};
use crate::ingest::source_file::{REGION_DIR_PREFIXES, SourceFileParser};
use crate::model::{DocType, FileOutcome, LoadStatus, SourceFile, StatusRecord};
use crate::store::ConnectionFactory;

#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<SourceFile>,
    /// Paths that sit in a partition but do not follow the naming contract.
    pub rejected: Vec<String>,
}

/// Walks `{root}/{partition}/region=XX/*.csv` for every document type.
/// The full list is built before any load starts.
pub fn discover_files(data_root: &Path) -> Result<Discovery, IngestError> {
    let parser = SourceFileParser::new()?;
    let mut discovery = Discovery::default();

    for doc_type in DocType::ALL {
        let partition = data_root.join(doc_type.partition());
        if !partition.is_dir() {
            debug!(partition = %partition.display(), "partition missing");
            continue;
        }

        let escaped = Pattern::escape(&partition.display().to_string());
        for prefix in REGION_DIR_PREFIXES {
            let pattern = format!("{escaped}/{prefix}*/*.csv");
            let entries = glob::glob(&pattern)
                .map_err(|err| IngestError::InvalidPattern(format!("{pattern}: {err}")))?;

            for entry in entries {
                let path = match entry {
                    Ok(path) => path,
                    Err(err) => {
                        warn!(error = %err, "error accessing path");
                        continue;
                    }
                };
                if !path.is_file() {
                    continue;
                }
                match parser.parse(&path, Some(doc_type)) {
                    Ok(file) => discovery.files.push(file),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping file");
                        discovery.rejected.push(path.display().to_string());
                    }
                }
            }
        }
    }

    discovery.files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(discovery)
}

/// Writes `started`, runs the load, then records `completed` or `failed`.
/// `failure_label` prefixes the stored error text.
pub fn tracked_load(
    connection: &mut Connection,
    loader: &DocumentLoader<'_>,
    file: &SourceFile,
    digest: &str,
    failure_label: Option<&str>,
) -> Result<LoadOutcome, IngestError> {
    ledger::upsert_status(connection, &StatusUpdate::for_file(file, digest, LoadStatus::Started))?;

    match loader.load(connection, file, Some(digest)) {
        Ok(outcome) => {
            ledger::upsert_status(
                connection,
                &StatusUpdate::for_file(file, digest, LoadStatus::Completed).with_rows(outcome.rows),
            )?;
            Ok(outcome)
        }
        Err(err) => {
            let message = match failure_label {
                Some(label) => format!("{label}: {err}"),
                None => err.to_string(),
            };
            let update = StatusUpdate::for_file(file, digest, LoadStatus::Failed).with_error(&message);
            if let Err(status_err) = ledger::upsert_status(connection, &update) {
                error!(digest, load_error = %err, "could not record failed load");
                return Err(status_err);
            }
            Err(err)
        }
    }
}

/// Runs file loads on a bounded worker pool. Each worker opens its own
/// store connection.
pub struct LoadScheduler<'a, F: ConnectionFactory> {
    config: &'a LoaderConfig,
    factory: &'a F,
    cancel: Arc<AtomicBool>,
    force: bool,
}

impl<'a, F: ConnectionFactory> LoadScheduler<'a, F> {
    pub fn new(config: &'a LoaderConfig, factory: &'a F) -> Self {
        Self {
            config,
            factory,
            cancel: Arc::new(AtomicBool::new(false)),
            force: false,
        }
    }

    /// Once the flag is set, files not yet picked up are reported as not
    /// started. Loads already running finish normally.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Load even when the ledger already knows the digest.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn run(&self, files: &[SourceFile]) -> Result<Vec<FileOutcome>, IngestError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|idx| format!("sst-load-{idx}"))
            .build()?;

        info!(files = files.len(), workers = self.config.workers, "dispatching loads");
        let outcomes = pool.install(|| {
            files
                .par_iter()
                .with_max_len(1)
                .map(|file| {
                    if self.cancel.load(Ordering::SeqCst) {
                        FileOutcome::pending(file)
                    } else {
                        self.process_file(file)
                    }
                })
                .collect::<Vec<_>>()
        });
        Ok(outcomes)
    }

    pub fn process_file(&self, file: &SourceFile) -> FileOutcome {
        let mut outcome = FileOutcome::pending(file);
        outcome.started = true;

        let digest = match ledger::file_digest(&file.path) {
            Ok(digest) => digest,
            Err(err) => return fail(outcome, &err),
        };
        outcome.digest = Some(digest.clone());

        let mut connection = match self.factory.connect() {
            Ok(connection) => connection,
            Err(err) => return fail(outcome, &err),
        };

        if !self.force {
            match previous_load(&connection, &digest) {
                Ok(Some(record)) => match record.status {
                    LoadStatus::Completed => {
                        debug!(path = %file.path.display(), "already loaded, skipping");
                        outcome.success = true;
                        outcome.skipped = true;
                        return outcome;
                    }
                    LoadStatus::Failed => {
                        info!(
                            path = %file.path.display(),
                            attempts = record.attempts,
                            "previous load failed, leaving it to retry"
                        );
                        outcome.skipped = true;
                        outcome.error = record.error;
                        return outcome;
                    }
                    LoadStatus::Started => {
                        warn!(path = %file.path.display(), "stale started record, reloading");
                    }
                },
                Ok(None) => {}
                Err(err) => return fail(outcome, &err),
            }
        }

        let loader = DocumentLoader::new(self.config);
        match tracked_load(&mut connection, &loader, file, &digest, None) {
            Ok(load) => {
                debug!(
                    path = %outcome.path,
                    document_version_id = load.document_version_id,
                    effective_date = %load.effective_date,
                    row_errors = load.row_errors,
                    "file committed"
                );
                outcome.success = true;
                outcome.rows = Some(load.rows);
                outcome.warnings = load.warnings;
                outcome
            }
            Err(err) => fail(outcome, &err),
        }
    }
}

fn previous_load(connection: &Connection, digest: &str) -> Result<Option<StatusRecord>, IngestError> {
    if ledger::is_new(connection, digest)? {
        return Ok(None);
    }
    ledger::lookup(connection, digest)
}

fn fail(mut outcome: FileOutcome, err: &IngestError) -> FileOutcome {
    error!(path = %outcome.path, error = %err, "load failed");
    outcome.success = false;
    outcome.error = Some(err.to_string());
    outcome
}
