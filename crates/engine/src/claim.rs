//! Dispatch claims: at most one in-flight send per queue entry.
//!
//! The `pending` guard alone is not atomic with the send: two deliveries of the same
//! creation event can both observe `pending` and both send. Taking a claim before the
//! send closes that window for concurrent deliveries.
//!
//! [`RedisClaim`] uses Redis `SET NX PX` for an atomic check-and-set with automatic TTL
//! expiry, so a crashed worker's claim frees itself. A held claim is a deferral: the
//! dispatcher reports it as retryable and the event is redelivered after the TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use pushq_common::error::AppError;

#[async_trait]
pub trait DispatchClaim: Send + Sync {
    /// Try to take the claim for `entry_id`.
    ///
    /// Returns `true` if this caller now holds it, `false` if someone else does.
    async fn try_claim(&self, entry_id: Uuid) -> Result<bool, AppError>;

    /// Give the claim back so a redelivery can proceed.
    async fn release(&self, entry_id: Uuid) -> Result<(), AppError>;
}

/// Always grants the claim. Used when no Redis is configured.
pub struct NoopClaim;

#[async_trait]
impl DispatchClaim for NoopClaim {
    async fn try_claim(&self, _entry_id: Uuid) -> Result<bool, AppError> {
        Ok(true)
    }

    async fn release(&self, _entry_id: Uuid) -> Result<(), AppError> {
        Ok(())
    }
}

/// Redis-backed claim shared by every worker process.
pub struct RedisClaim {
    redis: ConnectionManager,
    ttl_millis: u64,
}

impl RedisClaim {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self {
            redis,
            ttl_millis: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1),
        }
    }

    fn key(entry_id: Uuid) -> String {
        format!("fcm_queue:claim:{}", entry_id)
    }
}

#[async_trait]
impl DispatchClaim for RedisClaim {
    async fn try_claim(&self, entry_id: Uuid) -> Result<bool, AppError> {
        let mut redis = self.redis.clone();

        // SET key "1" NX PX ttl
        // Returns Some("OK") if the key was set, None if it already exists.
        let result: Option<String> = redis::cmd("SET")
            .arg(Self::key(entry_id))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_millis)
            .query_async(&mut redis)
            .await?;

        Ok(result.is_some())
    }

    async fn release(&self, entry_id: Uuid) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        redis.del::<_, ()>(Self::key(entry_id)).await?;
        Ok(())
    }
}

/// Process-local claim set. Claims never lapse unless a TTL is given.
#[derive(Default)]
pub struct MemoryClaim {
    /// Claim holders and when their claim lapses.
    held: Mutex<HashMap<Uuid, Option<Instant>>>,
    ttl: Option<Duration>,
}

impl MemoryClaim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn is_held(&self, entry_id: Uuid) -> bool {
        let now = Instant::now();
        self.held
            .lock()
            .map(|held| held.get(&entry_id).is_some_and(|lapses| is_live(*lapses, now)))
            .unwrap_or(false)
    }
}

fn is_live(lapses: Option<Instant>, now: Instant) -> bool {
    lapses.is_none_or(|at| now < at)
}

#[async_trait]
impl DispatchClaim for MemoryClaim {
    async fn try_claim(&self, entry_id: Uuid) -> Result<bool, AppError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| AppError::Internal("claim lock poisoned".to_string()))?;

        let now = Instant::now();
        if held.get(&entry_id).is_some_and(|lapses| is_live(*lapses, now)) {
            return Ok(false);
        }
        held.insert(entry_id, self.ttl.map(|ttl| now + ttl));
        Ok(true)
    }

    async fn release(&self, entry_id: Uuid) -> Result<(), AppError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| AppError::Internal("claim lock poisoned".to_string()))?;
        held.remove(&entry_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_claim_key() {
        let id = Uuid::parse_str("6f1c2d3e-4b5a-4c6d-8e7f-001122334455").unwrap();
        assert_eq!(
            RedisClaim::key(id),
            "fcm_queue:claim:6f1c2d3e-4b5a-4c6d-8e7f-001122334455"
        );
    }

    #[tokio::test]
    async fn test_noop_claim_always_grants() {
        let id = Uuid::new_v4();
        assert!(NoopClaim.try_claim(id).await.unwrap());
        assert!(NoopClaim.try_claim(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_claim_is_exclusive_until_released() {
        let claim = MemoryClaim::new();
        let id = Uuid::new_v4();

        assert!(claim.try_claim(id).await.unwrap());
        assert!(!claim.try_claim(id).await.unwrap());
        assert!(claim.is_held(id));

        claim.release(id).await.unwrap();
        assert!(!claim.is_held(id));
        assert!(claim.try_claim(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_claim_lapses_after_ttl() {
        let claim = MemoryClaim::with_ttl(Duration::from_millis(30));
        let id = Uuid::new_v4();

        assert!(claim.try_claim(id).await.unwrap());
        assert!(!claim.try_claim(id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!claim.is_held(id));
        assert!(claim.try_claim(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_claims_are_per_entry() {
        let claim = MemoryClaim::new();
        assert!(claim.try_claim(Uuid::new_v4()).await.unwrap());
        assert!(claim.try_claim(Uuid::new_v4()).await.unwrap());
    }
}
