use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use tokio::sync::mpsc;
use uuid::Uuid;

use pushq_common::error::AppError;
use pushq_common::types::{
    DeliveryOutcome, NewQueueEntry, NotificationContent, QUEUE_COLLECTION, QueueEntry,
    QueueStatus,
};

use super::{QueueStore, WATCH_BUFFER};

/// Channel the `fcm_queue_notify_created` trigger publishes new ids on.
pub const CREATED_CHANNEL: &str = "fcm_queue_created";

const ENTRY_COLUMNS: &str = "id, status, token, notification, data, created_at, sent_at, failed_at, message_id, error";

/// Postgres-backed queue store over the `fcm_queue` table.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    /// How far back pending entries are replayed when the listener (re)connects.
    replay_window: chrono::Duration,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    status: QueueStatus,
    token: String,
    notification: Json<NotificationContent>,
    data: Option<Json<HashMap<String, String>>>,
    created_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    message_id: Option<String>,
    error: Option<String>,
}

impl From<QueueRow> for QueueEntry {
    fn from(row: QueueRow) -> Self {
        QueueEntry {
            id: row.id,
            status: row.status,
            token: row.token,
            notification: row.notification.0,
            data: row.data.map(|d| d.0).unwrap_or_default(),
            created_at: row.created_at,
            sent_at: row.sent_at,
            failed_at: row.failed_at,
            message_id: row.message_id,
            error: row.error,
        }
    }
}

impl PgQueueStore {
    pub fn new(pool: PgPool, replay_window: chrono::Duration) -> Self {
        Self {
            pool,
            replay_window,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a request the way a producer does. The store assigns the id.
    pub async fn enqueue(&self, entry: &NewQueueEntry) -> Result<Uuid, AppError> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO fcm_queue (status, token, notification, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(entry.status)
        .bind(&entry.token)
        .bind(Json(&entry.notification))
        .bind(Json(&entry.data))
        .bind(entry.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Pending entries created after `since`, oldest first, followed by pending entries
    /// without a creation time (those are never swept, so they are always replayed).
    pub async fn pending_since(&self, since: DateTime<Utc>) -> Result<Vec<QueueEntry>, AppError> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM fcm_queue
            WHERE status = 'pending' AND (created_at >= $1 OR created_at IS NULL)
            ORDER BY created_at NULLS LAST
            "#,
            ENTRY_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(QueueEntry::from).collect())
    }

    /// Forward still-pending entries that may have missed their creation event.
    /// Returns `false` once the receiving side is gone.
    async fn replay_pending(&self, tx: &mpsc::Sender<QueueEntry>) -> bool {
        let since = Utc::now() - self.replay_window;
        match self.pending_since(since).await {
            Ok(entries) => {
                if !entries.is_empty() {
                    tracing::info!(count = entries.len(), "Replaying pending queue entries");
                }
                for entry in entries {
                    if tx.send(entry).await.is_err() {
                        return false;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load pending entries for replay");
            }
        }
        true
    }

    async fn forward_notification(&self, payload: &str, tx: &mpsc::Sender<QueueEntry>) -> bool {
        let id = match Uuid::parse_str(payload) {
            Ok(id) => id,
            Err(_) => {
                tracing::warn!(payload, "Ignoring creation event with invalid id");
                return true;
            }
        };

        match self.get(id).await {
            Ok(Some(entry)) => tx.send(entry).await.is_ok(),
            Ok(None) => {
                tracing::debug!(entry_id = %id, "Created entry no longer exists");
                true
            }
            Err(e) => {
                tracing::warn!(entry_id = %id, error = %e, "Failed to load created entry");
                true
            }
        }
    }

    async fn listen_loop(self, mut listener: PgListener, tx: mpsc::Sender<QueueEntry>) {
        if !self.replay_pending(&tx).await {
            return;
        }

        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => {
                    if !self.forward_notification(notification.payload(), &tx).await {
                        break;
                    }
                }
                Ok(None) => {
                    // Connection was lost and re-established; notifications sent in
                    // between are gone.
                    tracing::warn!("Queue listener reconnected, replaying pending entries");
                    if !self.replay_pending(&tx).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Queue listener error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            if tx.is_closed() {
                break;
            }
        }

        tracing::info!("Queue listener stopped");
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn watch_created(&self) -> Result<mpsc::Receiver<QueueEntry>, AppError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CREATED_CHANNEL).await?;
        tracing::info!(
            table = QUEUE_COLLECTION,
            channel = CREATED_CHANNEL,
            "Listening for new queue entries"
        );

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(self.clone().listen_loop(listener, tx));
        Ok(rx)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueEntry>, AppError> {
        let row: Option<QueueRow> = sqlx::query_as(&format!(
            "SELECT {} FROM fcm_queue WHERE id = $1",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(QueueEntry::from))
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: &DeliveryOutcome,
    ) -> Result<bool, AppError> {
        let result = match outcome {
            DeliveryOutcome::Sent { message_id, at } => {
                sqlx::query(
                    r#"
                    UPDATE fcm_queue
                    SET status = 'sent', message_id = $2, sent_at = $3
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(message_id)
                .bind(at)
                .execute(&self.pool)
                .await?
            }
            DeliveryOutcome::Failed { error, at } => {
                sqlx::query(
                    r#"
                    UPDATE fcm_queue
                    SET status = 'failed', error = $2, failed_at = $3
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(error)
                .bind(at)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn find_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM fcm_queue WHERE created_at < $1")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM fcm_queue WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
