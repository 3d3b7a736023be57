use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::open_store;
use crate::config::LoaderConfig;
use crate::ingest::ledger;
use crate::store::{ConnectionFactory, count_rows};

const ITEM_TABLES: [&str; 4] = [
    "document_versions",
    "definition_items",
    "compliance_items",
    "practice_items",
];

pub fn run(args: StatusArgs) -> Result<()> {
    let config = LoaderConfig::from_args(&args.store)?;
    info!(
        db_path = %config.db_path.display(),
        data_root = %config.data_root.display(),
        days = args.days,
        "status requested"
    );

    if !config.data_root.is_dir() {
        warn!(path = %config.data_root.display(), "data root missing");
    }

    let connection = open_store(&config)?.connect()?;
    for table in ITEM_TABLES {
        info!(table, rows = count_rows(&connection, table)?, "table size");
    }

    let summary = ledger::status_summary(&connection, args.days)?;
    if summary.is_empty() {
        info!(days = args.days, "no ledger activity in window");
    }
    for entry in &summary {
        info!(
            status = %entry.status,
            count = entry.count,
            regions = entry.regions,
            doc_types = entry.doc_types,
            "ledger activity"
        );
    }

    Ok(())
}
