use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_ERROR_THRESHOLD, DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_WORKERS};

#[derive(Parser, Debug)]
#[command(
    name = "sst-loader",
    version,
    about = "Load sales-tax compliance documents into a local relational store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a single captured file.
    Load(LoadArgs),
    /// Load every file under the partitioned data root.
    Bulk(BulkArgs),
    /// Retry failed loads that are still under the attempt ceiling.
    Retry(RetryArgs),
    /// List failed loads.
    Failed(FailedArgs),
    /// Load duration summary per document type.
    Performance(ReportArgs),
    /// Recent ledger activity and table counts.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "SST_DATA_ROOT", default_value = "data/raw/sst")]
    pub data_root: PathBuf,

    #[arg(long, env = "SST_DB_PATH", default_value = "sst.sqlite")]
    pub db_path: PathBuf,

    #[arg(long, env = "SST_MANIFEST_DIR")]
    pub manifest_dir: Option<PathBuf>,

    #[arg(long, env = "SST_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    #[arg(long, env = "SST_ERROR_THRESHOLD", default_value_t = DEFAULT_ERROR_THRESHOLD)]
    pub error_threshold: f64,

    #[arg(long, env = "SST_MAX_RETRY_ATTEMPTS", default_value_t = DEFAULT_MAX_RETRY_ATTEMPTS)]
    pub max_retry_attempts: u32,

    #[arg(long, default_value_t = 0)]
    pub retry_backoff_ms: u64,

    #[arg(long, default_value_t = 30)]
    pub lock_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Path to a file named `{doc}_{REGION}_{version}_{timestamp}.csv`.
    pub file: PathBuf,

    /// Overrides the document type inferred from the partition folder.
    #[arg(long)]
    pub doc_type: Option<String>,

    /// Load even when the digest already has a ledger record.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BulkArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Overrides `--max-retry-attempts` for this run.
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct FailedArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Include loads that already reached the attempt ceiling.
    #[arg(long, default_value_t = false)]
    pub all: bool,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, default_value_t = 7)]
    pub days: i64,
}
