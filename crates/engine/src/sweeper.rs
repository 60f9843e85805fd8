//! Retention sweeper: deletes queue entries older than the retention window.
//!
//! Every entry created before `now - window` is deleted regardless of status, in
//! chunks of at most `batch_size`. Each chunk commits on its own; a failed chunk is
//! logged and left for the next run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use pushq_common::config::RetentionConfig;
use pushq_common::error::AppError;

use crate::store::QueueStore;

/// Result of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub cutoff: DateTime<Utc>,
    pub matched: usize,
    pub deleted: u64,
    pub failed_batches: usize,
}

pub struct Sweeper {
    store: Arc<dyn QueueStore>,
    config: RetentionConfig,
}

impl Sweeper {
    pub fn new(store: Arc<dyn QueueStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.window
    }

    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        self.sweep_at(Utc::now()).await
    }

    /// Delete every entry created before `cutoff(now)`.
    ///
    /// Only the initial query failing is an error. Batch failures are counted in the
    /// report.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let cutoff = self.cutoff(now);
        let ids = self.store.find_created_before(cutoff).await?;

        let mut report = SweepReport {
            cutoff,
            matched: ids.len(),
            deleted: 0,
            failed_batches: 0,
        };

        if ids.is_empty() {
            tracing::info!(cutoff = %cutoff, "No expired FCM queue items");
            return Ok(report);
        }

        let batch_size = self.config.batch_size.max(1);
        for (index, batch) in ids.chunks(batch_size).enumerate() {
            match self.store.delete_batch(batch).await {
                Ok(deleted) => {
                    report.deleted += deleted;
                    tracing::debug!(batch = index, deleted, "Delete batch committed");
                }
                Err(e) => {
                    report.failed_batches += 1;
                    tracing::warn!(
                        batch = index,
                        size = batch.len(),
                        error = %e,
                        "Delete batch failed, leaving it for the next sweep"
                    );
                }
            }
        }

        tracing::info!(
            cutoff = %cutoff,
            matched = report.matched,
            deleted = report.deleted,
            failed_batches = report.failed_batches,
            "Cleaned up old FCM queue items"
        );

        Ok(report)
    }

    /// Sweep at startup, then every `check_interval`, until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            window_days = self.config.window.num_days(),
            interval_secs = self.config.check_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Retention sweeper started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }

        tracing::info!("Retention sweeper stopped");
    }
}
