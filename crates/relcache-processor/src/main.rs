//! Batch processor binary for relcache.
//!
//! Reads newline-delimited transfer records and indexes them into
//! `PostgreSQL`, one transaction per batch, through the relcache session
//! cache.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration from `relcache.yaml` (or the path given as the
//!    first argument)
//! 3. Build the schema catalog and validate its write order
//! 4. Connect to `PostgreSQL` and create missing tables
//! 5. Run the batch loop over the input file
//! 6. Log the result

mod config;
mod error;
mod processor;
mod transfers;

use std::path::Path;
use std::sync::Arc;

use relcache_core::Catalog;
use relcache_db::{PgStore, PostgresPool};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ProcessorConfig;
use crate::error::ProcessorError;
use crate::processor::Processor;
use crate::transfers::TransferHandler;

/// Default configuration file path.
const DEFAULT_CONFIG_PATH: &str = "relcache.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if startup fails or any batch fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("relcache-processor starting");

    // 2. Load configuration.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let config = ProcessorConfig::from_file(Path::new(&config_path))?;
    info!(
        config = %config_path,
        input = %config.processor.input.display(),
        batch_size = config.processor.batch_size,
        "Configuration loaded"
    );

    // 3. Build the catalog.
    let registry = match config.schema.clone() {
        Some(registry) => registry,
        None => transfers::schema()?,
    };
    let catalog = Arc::new(Catalog::new(registry));
    let order = catalog.write_order()?;
    info!(
        entities = order.len(),
        write_order = ?order,
        "Schema catalog ready"
    );

    // 4. Connect and prepare tables.
    let pool = PostgresPool::connect(&config.database.pool_config()).await?;
    if config.database.create_tables {
        let store = PgStore::begin(&pool, Arc::clone(&catalog)).await?;
        store.create_tables().await?;
        store.commit().await?;
    }

    // 5. Run the batch loop.
    let result = run(&config, pool.clone(), catalog).await;
    pool.close().await;

    // 6. Report.
    let stats = result?;
    info!(
        batches = stats.batches,
        records = stats.records,
        "relcache-processor finished"
    );
    Ok(())
}

async fn run(
    config: &ProcessorConfig,
    pool: PostgresPool,
    catalog: Arc<Catalog>,
) -> Result<processor::RunStats, ProcessorError> {
    let input = tokio::fs::File::open(&config.processor.input).await?;
    Processor::new(pool, catalog, TransferHandler)
        .with_batch_size(config.processor.batch_size)
        .run(BufReader::new(input))
        .await
}
