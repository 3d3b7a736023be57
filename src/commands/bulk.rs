use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::BulkArgs;
use crate::commands::open_store;
use crate::config::LoaderConfig;
use crate::ingest::{LoadScheduler, discover_files};
use crate::model::{BulkCounts, BulkRunManifest};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: BulkArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("bulk-{}", utc_compact_string(started_ts));

    let config = LoaderConfig::from_args(&args.store)?;
    info!(
        data_root = %config.data_root.display(),
        run_id = %run_id,
        workers = config.workers,
        "starting bulk load"
    );

    let discovery = discover_files(&config.data_root)
        .with_context(|| format!("failed to scan {}", config.data_root.display()))?;
    if discovery.files.is_empty() {
        warn!(data_root = %config.data_root.display(), "no source files found");
    }

    if args.dry_run {
        for file in &discovery.files {
            info!(
                path = %file.path.display(),
                doc_type = %file.doc_type,
                region = %file.region,
                version = %file.version,
                "would load"
            );
        }
        info!(
            files = discovery.files.len(),
            rejected = discovery.rejected.len(),
            "dry run complete"
        );
        return Ok(());
    }

    let factory = open_store(&config)?;
    ensure_directory(&config.manifest_dir)?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
        })
        .context("failed to install interrupt handler")?;
    }

    let outcomes = LoadScheduler::new(&config, &factory)
        .with_cancel_flag(Arc::clone(&cancel))
        .run(&discovery.files)?;
    let counts = BulkCounts::tally(&outcomes);

    let status = if cancel.load(Ordering::SeqCst) {
        "interrupted"
    } else if counts.failed > 0 {
        "completed_with_failures"
    } else {
        "completed"
    };

    for outcome in outcomes.iter().filter(|outcome| outcome.is_failure()) {
        warn!(
            path = %outcome.path,
            error = %outcome.error.as_deref().unwrap_or_default(),
            "file failed"
        );
    }

    let manifest = BulkRunManifest {
        manifest_version: 1,
        run_id,
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        data_root: config.data_root.display().to_string(),
        db_path: config.db_path.display().to_string(),
        workers: config.workers,
        counts: counts.clone(),
        rejected_files: discovery.rejected,
        outcomes,
    };
    let manifest_path = config
        .manifest_dir
        .join(format!("bulk_run_{}.json", utc_compact_string(started_ts)));
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote bulk run manifest");

    info!(
        discovered = counts.discovered,
        succeeded = counts.succeeded,
        skipped = counts.skipped,
        failed = counts.failed,
        not_started = counts.not_started,
        status,
        "bulk load finished"
    );

    if counts.failed > 0 || counts.not_started > 0 {
        bail!(
            "{} file(s) failed and {} were not started",
            counts.failed,
            counts.not_started
        );
    }
    Ok(())
}
