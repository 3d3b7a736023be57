use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::cli::StoreArgs;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_ERROR_THRESHOLD: f64 = 0.10;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_DATA_START_FALLBACK: usize = 4;

/// Read-only settings shared by every component of a run.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub data_root: PathBuf,
    pub db_path: PathBuf,
    pub manifest_dir: PathBuf,
    pub workers: usize,
    pub error_threshold: f64,
    pub max_retry_attempts: u32,
    pub retry_backoff: Duration,
    pub lock_timeout: Duration,
    pub data_start_fallback: usize,
}

impl LoaderConfig {
    pub fn new(data_root: PathBuf, db_path: PathBuf) -> Self {
        let manifest_dir = data_root.join("manifests");
        Self {
            data_root,
            db_path,
            manifest_dir,
            workers: DEFAULT_WORKERS,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_backoff: Duration::ZERO,
            lock_timeout: Duration::from_secs(30),
            data_start_fallback: DEFAULT_DATA_START_FALLBACK,
        }
    }

    pub fn from_args(args: &StoreArgs) -> Result<Self> {
        let mut config = Self::new(args.data_root.clone(), args.db_path.clone());
        if let Some(manifest_dir) = &args.manifest_dir {
            config.manifest_dir = manifest_dir.clone();
        }
        config.workers = args.workers;
        config.error_threshold = args.error_threshold;
        config.max_retry_attempts = args.max_retry_attempts;
        config.retry_backoff = Duration::from_millis(args.retry_backoff_ms);
        config.lock_timeout = Duration::from_secs(args.lock_timeout_secs);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.error_threshold) {
            bail!(
                "error threshold must be between 0 and 1, got {}",
                self.error_threshold
            );
        }
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        if self.max_retry_attempts == 0 {
            bail!("max retry attempts must be at least 1");
        }
        Ok(())
    }
}
