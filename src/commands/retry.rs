use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::RetryArgs;
use crate::commands::open_store;
use crate::config::LoaderConfig;
use crate::ingest::RecoveryCoordinator;
use crate::util::{utc_compact_string, write_json_pretty};

pub fn run(args: RetryArgs) -> Result<()> {
    let started_ts = Utc::now();
    let config = LoaderConfig::from_args(&args.store)?;
    let ceiling = args.max_attempts.unwrap_or(config.max_retry_attempts);
    let factory = open_store(&config)?;

    info!(ceiling, backoff_ms = config.retry_backoff.as_millis() as u64, "retrying failed loads");
    let report = RecoveryCoordinator::new(&config, &factory).retry_failed(ceiling)?;

    for detail in report.details.iter().filter(|detail| !detail.success) {
        warn!(
            digest = %detail.digest,
            doc_type = %detail.doc_type,
            region = %detail.region,
            version = %detail.version,
            attempt = detail.attempt,
            error = %detail.error.as_deref().unwrap_or_default(),
            "retry did not succeed"
        );
    }

    let report_path = config
        .manifest_dir
        .join(format!("retry_run_{}.json", utc_compact_string(started_ts)));
    write_json_pretty(&report_path, &report)?;

    info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failed,
        path = %report_path.display(),
        "retry finished"
    );

    if report.failed > 0 {
        bail!("{} of {} retries failed", report.failed, report.attempted);
    }
    Ok(())
}
