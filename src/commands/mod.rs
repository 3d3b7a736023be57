pub mod bulk;
pub mod failed;
pub mod load;
pub mod performance;
pub mod retry;
pub mod status;

use anyhow::{Context, Result};

use crate::config::LoaderConfig;
use crate::store::SqliteConnectionFactory;

fn open_store(config: &LoaderConfig) -> Result<SqliteConnectionFactory> {
    let factory = SqliteConnectionFactory::new(&config.db_path, config.lock_timeout);
    factory
        .bootstrap()
        .with_context(|| format!("failed to prepare store {}", factory.db_path().display()))?;
    Ok(factory)
}
