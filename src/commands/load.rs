use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::LoadArgs;
use crate::commands::open_store;
use crate::config::LoaderConfig;
use crate::ingest::{LoadScheduler, SourceFileParser};
use crate::model::DocType;

pub fn run(args: LoadArgs) -> Result<()> {
    let config = LoaderConfig::from_args(&args.store)?;
    let factory = open_store(&config)?;

    let doc_type = args
        .doc_type
        .as_deref()
        .map(str::parse::<DocType>)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let file = SourceFileParser::new()?
        .parse(&args.file, doc_type)
        .with_context(|| format!("cannot load {}", args.file.display()))?;

    info!(
        path = %file.path.display(),
        doc_type = %file.doc_type,
        region = %file.region,
        version = %file.version,
        force = args.force,
        "loading file"
    );

    let outcome = LoadScheduler::new(&config, &factory)
        .with_force(args.force)
        .process_file(&file);

    if outcome.skipped {
        if outcome.success {
            info!(path = %outcome.path, "file already loaded");
            return Ok(());
        }
        warn!(
            path = %outcome.path,
            error = %outcome.error.clone().unwrap_or_default(),
            "file has a failed load on record"
        );
        bail!("previous load of {} failed; run `retry` or pass --force", outcome.path);
    }

    if !outcome.success {
        bail!(
            "load failed for {}: {}",
            outcome.path,
            outcome.error.unwrap_or_default()
        );
    }

    info!(
        path = %outcome.path,
        rows = outcome.rows.unwrap_or_default(),
        warnings = outcome.warnings.len(),
        "load completed"
    );
    Ok(())
}
