use std::io::{self, Write};

use anyhow::Result;

use crate::cli::ReportArgs;
use crate::commands::open_store;
use crate::config::LoaderConfig;
use crate::ingest::ledger;
use crate::store::ConnectionFactory;
use crate::util::write_json_stdout;

pub fn run(args: ReportArgs) -> Result<()> {
    let config = LoaderConfig::from_args(&args.store)?;
    let connection = open_store(&config)?.connect()?;
    let rows = ledger::performance_summary(&connection)?;

    if args.json {
        return write_json_stdout(&rows);
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, "{:<6} {:>8} {:>10} {:>10} {:>10}", "type", "loads", "avg_s", "min_s", "max_s")?;
    for row in &rows {
        writeln!(
            output,
            "{:<6} {:>8} {:>10.3} {:>10.3} {:>10.3}",
            row.doc_type, row.sample_size, row.avg_seconds, row.min_seconds, row.max_seconds
        )?;
    }
    output.flush()?;
    Ok(())
}
