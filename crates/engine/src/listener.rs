//! Trigger listener: feeds creation events into the dispatcher.
//!
//! Consumes `QueueStore::watch_created()` and runs one dispatch per event, with at
//! most `max_concurrency` in flight. A failed invocation (outcome write failure) is
//! redelivered with linear backoff, re-reading the entry first so the `pending` guard
//! sees what the store holds now. An invocation deferred by a held claim is redelivered
//! only after the claim TTL, by which point a live holder has recorded its outcome and
//! a crashed holder's claim has lapsed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use pushq_common::error::AppError;
use pushq_common::types::QueueEntry;

use crate::dispatcher::Dispatcher;

pub struct DispatchListener {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchListener {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Dispatch creation events until `shutdown` flips or the event stream ends.
    /// In-flight dispatches are awaited before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
        let mut events = self.dispatcher.store().watch_created().await?;
        let permits = Arc::new(Semaphore::new(self.dispatcher.config().max_concurrency));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            max_concurrency = self.dispatcher.config().max_concurrency,
            "Dispatch listener started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Dispatch task panicked");
                    }
                }
                next = events.recv() => {
                    let Some(entry) = next else {
                        tracing::warn!("Queue event stream ended");
                        break;
                    };

                    let permit = permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| AppError::Internal(format!("dispatch permits closed: {}", e)))?;
                    let dispatcher = Arc::clone(&self.dispatcher);

                    in_flight.spawn(async move {
                        let _permit = permit;
                        dispatch_with_redelivery(&dispatcher, entry).await;
                    });
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Dispatch listener stopping");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatch task panicked");
            }
        }

        Ok(())
    }
}

/// Run one dispatch, redelivering it while the failure looks transient.
pub async fn dispatch_with_redelivery(dispatcher: &Dispatcher, mut entry: QueueEntry) {
    let max_attempts = dispatcher.config().redelivery_attempts;
    let mut attempt = 0u32;

    loop {
        let err = match dispatcher.handle(&entry).await {
            Ok(_) => return,
            Err(e) => e,
        };

        if attempt >= max_attempts || !err.is_transient() {
            tracing::error!(
                entry_id = %entry.id,
                attempts = attempt + 1,
                error = %err,
                "Dispatch failed, giving up on this event"
            );
            return;
        }

        attempt += 1;
        let delay = redelivery_delay(dispatcher, &err, attempt);
        if matches!(err, AppError::ClaimHeld(_)) {
            tracing::info!(
                entry_id = %entry.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Queue entry claimed elsewhere, re-checking after the claim lapses"
            );
        } else {
            tracing::warn!(
                entry_id = %entry.id,
                attempt,
                error = %err,
                "Dispatch failed, redelivering"
            );
        }
        tokio::time::sleep(delay).await;

        match dispatcher.store().get(entry.id).await {
            Ok(Some(fresh)) => entry = fresh,
            Ok(None) => {
                tracing::debug!(entry_id = %entry.id, "Queue entry deleted before redelivery");
                return;
            }
            Err(e) => {
                tracing::warn!(
                    entry_id = %entry.id,
                    error = %e,
                    "Could not reload queue entry, redelivering last known copy"
                );
            }
        }
    }
}

fn redelivery_delay(dispatcher: &Dispatcher, err: &AppError, attempt: u32) -> Duration {
    let config = dispatcher.config();
    let backoff = config.redelivery_backoff.saturating_mul(attempt);
    match err {
        AppError::ClaimHeld(_) => config.claim_ttl.saturating_add(backoff),
        _ => backoff,
    }
}
