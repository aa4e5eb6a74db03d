//! The batch loop.
//!
//! Input records are read in batches of `batch_size`. Each batch runs in its
//! own session: a fresh [`CacheStore`] over a fresh [`PgStore`] transaction.
//! The handler reads and writes through the session, the session is flushed,
//! and the transaction commits. Any error rolls the transaction back and
//! stops the run, so a batch is applied completely or not at all.

use std::future::Future;
use std::sync::Arc;

use relcache_core::{CacheStore, Catalog, EntityStore};
use relcache_db::{PgStore, PostgresPool};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, info, warn};

use crate::error::ProcessorError;

/// Default number of records per batch.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Domain logic applied to one batch of records.
pub trait BatchHandler {
    /// Input record type, one JSON object per line.
    type Record: DeserializeOwned;

    /// Apply `records` through `session`. The caller flushes afterwards.
    fn handle<S: EntityStore>(
        &self,
        session: &mut CacheStore<S>,
        records: &[Self::Record],
    ) -> impl Future<Output = Result<(), ProcessorError>>;
}

/// Totals for a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Batches committed.
    pub batches: usize,
    /// Records processed.
    pub records: usize,
}

/// Drives a [`BatchHandler`] over an input stream.
pub struct Processor<H> {
    pool: PostgresPool,
    catalog: Arc<Catalog>,
    handler: H,
    batch_size: usize,
}

impl<H: BatchHandler> Processor<H> {
    /// Create a processor writing to `pool`.
    pub const fn new(pool: PostgresPool, catalog: Arc<Catalog>, handler: H) -> Self {
        Self {
            pool,
            catalog,
            handler,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the number of records per batch.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Process every record in `input`.
    pub async fn run<R: AsyncBufRead + Unpin>(&self, input: R) -> Result<RunStats, ProcessorError> {
        let mut lines = input.lines();
        let mut line_no = 0;
        let mut stats = RunStats::default();
        loop {
            let batch = read_batch(&mut lines, &mut line_no, self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            self.process_batch(&batch).await?;
            stats.batches = stats.batches.saturating_add(1);
            stats.records = stats.records.saturating_add(batch.len());
            info!(
                batch = stats.batches,
                records = batch.len(),
                last_line = line_no,
                "Batch committed"
            );
        }
        Ok(stats)
    }

    async fn process_batch(&self, records: &[H::Record]) -> Result<(), ProcessorError> {
        let store = PgStore::begin(&self.pool, Arc::clone(&self.catalog)).await?;
        let mut session = CacheStore::new(store, Arc::clone(&self.catalog));
        let outcome = run_session(&self.handler, &mut session, records).await;
        let store = session.into_inner();
        match outcome {
            Ok(()) => {
                store.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = store.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Apply one batch through `session` and flush it.
pub async fn run_session<H: BatchHandler, S: EntityStore>(
    handler: &H,
    session: &mut CacheStore<S>,
    records: &[H::Record],
) -> Result<(), ProcessorError> {
    handler.handle(session, records).await?;
    let pending = session.pending_writes();
    session.flush(None).await?;
    debug!(records = records.len(), writes = pending, "Session flushed");
    Ok(())
}

/// Read up to `limit` records, skipping blank lines. `line_no` tracks the
/// last line read for error reporting.
pub async fn read_batch<R, T>(
    lines: &mut Lines<R>,
    line_no: &mut usize,
    limit: usize,
) -> Result<Vec<T>, ProcessorError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut batch = Vec::new();
    while batch.len() < limit {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        *line_no = line_no.saturating_add(1);
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| ProcessorError::Decode {
            line: *line_no,
            source,
        })?;
        batch.push(record);
    }
    Ok(batch)
}
