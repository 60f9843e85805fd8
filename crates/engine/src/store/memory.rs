use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use pushq_common::error::AppError;
use pushq_common::types::{DeliveryOutcome, NewQueueEntry, QueueEntry};

use super::{QueueStore, WATCH_BUFFER};

/// In-memory queue store.
///
/// Keeps counters of outcome writes and committed delete batches, and can be told
/// to fail writes, so dispatch and sweep behavior can be observed without a database.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<Uuid, QueueEntry>,
    watchers: Vec<mpsc::Sender<QueueEntry>>,
    outcome_writes: usize,
    failing_outcome_writes: usize,
    delete_attempts: usize,
    delete_commits: usize,
    failing_delete_batches: HashSet<usize>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("memory store lock poisoned".to_string()))
    }

    /// Insert a request the way a producer does, emitting a creation event.
    pub async fn enqueue(&self, entry: NewQueueEntry) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        let entry = entry.into_entry(id);

        let watchers = {
            let mut state = self.state()?;
            state.entries.insert(id, entry.clone());
            state.watchers.retain(|w| !w.is_closed());
            state.watchers.clone()
        };

        for watcher in watchers {
            // A dropped watcher just misses the event.
            let _ = watcher.send(entry.clone()).await;
        }

        Ok(id)
    }

    /// Put an entry in place without emitting a creation event.
    pub fn seed(&self, entry: QueueEntry) -> Result<(), AppError> {
        self.state()?.entries.insert(entry.id, entry);
        Ok(())
    }

    pub fn entry(&self, id: Uuid) -> Option<QueueEntry> {
        self.state().ok()?.entries.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `record_outcome` calls, successful or not.
    pub fn outcome_writes(&self) -> usize {
        self.state().map(|s| s.outcome_writes).unwrap_or(0)
    }

    /// Number of delete batches that committed.
    pub fn delete_commits(&self) -> usize {
        self.state().map(|s| s.delete_commits).unwrap_or(0)
    }

    /// Make the next `count` outcome writes fail without applying.
    pub fn fail_next_outcome_writes(&self, count: usize) {
        if let Ok(mut state) = self.state() {
            state.failing_outcome_writes = count;
        }
    }

    /// Make the delete batch with this zero-based attempt number fail.
    pub fn fail_delete_batch(&self, attempt: usize) {
        if let Ok(mut state) = self.state() {
            state.failing_delete_batches.insert(attempt);
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn watch_created(&self) -> Result<mpsc::Receiver<QueueEntry>, AppError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.state()?.watchers.push(tx);
        Ok(rx)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueEntry>, AppError> {
        Ok(self.state()?.entries.get(&id).cloned())
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: &DeliveryOutcome,
    ) -> Result<bool, AppError> {
        let mut state = self.state()?;
        state.outcome_writes += 1;

        if state.failing_outcome_writes > 0 {
            state.failing_outcome_writes -= 1;
            return Err(AppError::Internal(format!(
                "simulated write failure for entry {}",
                id
            )));
        }

        Ok(state
            .entries
            .get_mut(&id)
            .is_some_and(|entry| entry.apply_outcome(outcome)))
    }

    async fn find_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let state = self.state()?;
        Ok(state
            .entries
            .values()
            .filter(|e| e.created_at.is_some_and(|created| created < cutoff))
            .map(|e| e.id)
            .collect())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<u64, AppError> {
        let mut state = self.state()?;
        let attempt = state.delete_attempts;
        state.delete_attempts += 1;

        if state.failing_delete_batches.contains(&attempt) {
            return Err(AppError::Internal(format!(
                "simulated commit failure for delete batch {}",
                attempt
            )));
        }

        let deleted = ids
            .iter()
            .filter(|id| state.entries.remove(*id).is_some())
            .count();
        state.delete_commits += 1;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushq_common::types::QueueStatus;

    #[tokio::test]
    async fn test_enqueue_emits_creation_event() {
        let store = MemoryQueueStore::new();
        let mut events = store.watch_created().await.unwrap();

        let id = store
            .enqueue(NewQueueEntry::pending("T1", "Hi", "B"))
            .await
            .unwrap();

        let created = events.recv().await.unwrap();
        assert_eq!(created.id, id);
        assert_eq!(created.status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_record_outcome_is_conditional() {
        let store = MemoryQueueStore::new();
        let id = store
            .enqueue(NewQueueEntry::pending("T1", "Hi", "B"))
            .await
            .unwrap();

        let sent = DeliveryOutcome::Sent {
            message_id: "MSG123".to_string(),
            at: Utc::now(),
        };
        let failed = DeliveryOutcome::Failed {
            error: "late".to_string(),
            at: Utc::now(),
        };

        assert!(store.record_outcome(id, &sent).await.unwrap());
        assert!(!store.record_outcome(id, &failed).await.unwrap());

        let entry = store.entry(id).unwrap();
        assert_eq!(entry.status, QueueStatus::Sent);
        assert!(entry.error.is_none());
        assert_eq!(store.outcome_writes(), 2);
    }

    #[tokio::test]
    async fn test_record_outcome_for_unknown_entry() {
        let store = MemoryQueueStore::new();
        let outcome = DeliveryOutcome::Sent {
            message_id: "MSG123".to_string(),
            at: Utc::now(),
        };
        assert!(!store.record_outcome(Uuid::new_v4(), &outcome).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_delete_failure_leaves_batch_intact() {
        let store = MemoryQueueStore::new();
        let id = store
            .enqueue(NewQueueEntry::pending("T1", "Hi", "B"))
            .await
            .unwrap();
        store.fail_delete_batch(0);

        assert!(store.delete_batch(&[id]).await.is_err());
        assert!(store.entry(id).is_some());
        assert_eq!(store.delete_commits(), 0);

        assert_eq!(store.delete_batch(&[id]).await.unwrap(), 1);
        assert!(store.is_empty());
    }
}
