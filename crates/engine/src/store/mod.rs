//! Queue store capability.
//!
//! The dispatcher and the sweeper only talk to [`QueueStore`]. Two implementations:
//! - [`postgres::PgQueueStore`]: the `fcm_queue` table, creation events via LISTEN/NOTIFY
//! - [`memory::MemoryQueueStore`]: in-process map, used in tests and local runs

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use pushq_common::error::AppError;
use pushq_common::types::{DeliveryOutcome, QueueEntry};

pub use memory::MemoryQueueStore;
pub use postgres::PgQueueStore;

/// Buffer between the store's event source and the dispatcher.
pub const WATCH_BUFFER: usize = 1024;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Subscribe to newly created entries. Each creation is delivered at least once.
    async fn watch_created(&self) -> Result<mpsc::Receiver<QueueEntry>, AppError>;

    /// Load one entry by id.
    async fn get(&self, id: Uuid) -> Result<Option<QueueEntry>, AppError>;

    /// Record a terminal outcome, only if the entry is still `pending`.
    ///
    /// Returns `false` when the entry was already terminal (or is gone) and nothing
    /// was written.
    async fn record_outcome(&self, id: Uuid, outcome: &DeliveryOutcome)
    -> Result<bool, AppError>;

    /// Ids of all entries with `created_at < cutoff`, whatever their status.
    /// Entries without `created_at` never match.
    async fn find_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, AppError>;

    /// Delete `ids` as one all-or-nothing batch. Returns the number of rows removed.
    async fn delete_batch(&self, ids: &[Uuid]) -> Result<u64, AppError>;
}
