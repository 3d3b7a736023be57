use std::io::{self, Write};

use anyhow::Result;
use tracing::info;

use crate::cli::FailedArgs;
use crate::commands::open_store;
use crate::config::LoaderConfig;
use crate::ingest::ledger;
use crate::model::StatusRecord;
use crate::store::ConnectionFactory;
use crate::util::write_json_stdout;

pub fn run(args: FailedArgs) -> Result<()> {
    let config = LoaderConfig::from_args(&args.store)?;
    let connection = open_store(&config)?.connect()?;

    let ceiling = (!args.all).then_some(config.max_retry_attempts);
    let records = ledger::failed_loads(&connection, ceiling)?;
    info!(count = records.len(), all = args.all, "failed loads");

    if args.json {
        return write_json_stdout(&records);
    }
    write_text(&records, config.max_retry_attempts)
}

fn write_text(records: &[StatusRecord], ceiling: u32) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, "Failed loads: {}", records.len())?;
    for record in records {
        writeln!(
            output,
            "{} {} {} attempts={}/{} updated={} digest={}",
            record.doc_type,
            record.region,
            record.version,
            record.attempts,
            ceiling,
            record.last_updated,
            record.digest,
        )?;
        if let Some(error) = &record.error {
            writeln!(output, "  {error}")?;
        }
    }
    output.flush()?;
    Ok(())
}
