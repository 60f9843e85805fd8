use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Default Android notification channel the mobile app registers.
pub const DEFAULT_ANDROID_CHANNEL_ID: &str = "getcars_channel";

/// Largest number of deletes the store applies in one atomic batch.
pub const MAX_SWEEP_BATCH_SIZE: usize = 500;

/// How much longer than a send a dispatch claim lives by default.
pub const CLAIM_TTL_MARGIN: Duration = Duration::from_secs(5);

const MAX_RETENTION_WINDOW_DAYS: i64 = 36_500;
const MAX_CHECK_INTERVAL_HOURS: u64 = 24 * 365;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Redis connection string. When set, dispatches take a per-entry claim first.
    pub redis_url: Option<String>,

    /// Path to the Google service-account JSON key
    pub credentials_path: String,

    /// Firebase project id (defaults to the service account's project)
    pub fcm_project_id: Option<String>,

    /// Base URL of the FCM HTTP v1 API
    pub fcm_base_url: String,

    pub dispatch: DispatchConfig,

    pub retention: RetentionConfig,
}

/// Tuning for the dispatcher and its trigger listener.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound on a single gateway send.
    pub send_timeout: Duration,
    /// Android channel hint attached to every message.
    pub android_channel_id: String,
    /// Maximum number of in-flight dispatches.
    pub max_concurrency: usize,
    /// Lifetime of a per-entry dispatch claim. Always longer than `send_timeout`, so a
    /// live holder finishes before its claim lapses and a crashed holder's claim frees
    /// itself shortly after.
    pub claim_ttl: Duration,
    /// Redeliveries after an invocation fails (outcome write failure or held claim).
    pub redelivery_attempts: u32,
    /// Base backoff between redeliveries, multiplied by the attempt number.
    pub redelivery_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            android_channel_id: DEFAULT_ANDROID_CHANNEL_ID.to_string(),
            max_concurrency: 32,
            claim_ttl: Duration::from_secs(10) + CLAIM_TTL_MARGIN,
            redelivery_attempts: 3,
            redelivery_backoff: Duration::from_millis(1000),
        }
    }
}

/// Retention window and sweep schedule.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Entries created before `now - window` are deleted.
    pub window: chrono::Duration,
    /// Time between scheduled sweeps.
    pub check_interval: Duration,
    /// Deletes per atomic batch.
    pub batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: chrono::Duration::days(7),
            check_interval: Duration::from_secs(24 * 60 * 60),
            batch_size: MAX_SWEEP_BATCH_SIZE,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup (the process environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                AppError::Config(format!("{} environment variable is required", key))
            })
        };

        let send_timeout = Duration::from_secs(parse_or(&lookup, "FCM_SEND_TIMEOUT_SECS", 10u64)?);
        let default_claim_ttl = send_timeout.checked_add(CLAIM_TTL_MARGIN).ok_or_else(|| {
            AppError::Config("FCM_SEND_TIMEOUT_SECS is out of range".to_string())
        })?;
        let claim_ttl = match lookup("DISPATCH_CLAIM_TTL_SECS") {
            Some(_) => Duration::from_secs(parse_or(&lookup, "DISPATCH_CLAIM_TTL_SECS", 0u64)?),
            None => default_claim_ttl,
        };

        let dispatch = DispatchConfig {
            send_timeout,
            android_channel_id: lookup("ANDROID_CHANNEL_ID")
                .unwrap_or_else(|| DEFAULT_ANDROID_CHANNEL_ID.to_string()),
            max_concurrency: parse_or(&lookup, "DISPATCH_MAX_CONCURRENCY", 32usize)?,
            claim_ttl,
            redelivery_attempts: parse_or(&lookup, "REDELIVERY_ATTEMPTS", 3u32)?,
            redelivery_backoff: Duration::from_millis(parse_or(
                &lookup,
                "REDELIVERY_BACKOFF_MS",
                1000u64,
            )?),
        };

        if dispatch.claim_ttl <= dispatch.send_timeout {
            return Err(AppError::Config(
                "DISPATCH_CLAIM_TTL_SECS must be longer than FCM_SEND_TIMEOUT_SECS".to_string(),
            ));
        }
        if dispatch.max_concurrency == 0 {
            return Err(AppError::Config(
                "DISPATCH_MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let window_days: i64 = parse_or(&lookup, "RETENTION_WINDOW_DAYS", 7i64)?;
        let interval_hours: u64 = parse_or(&lookup, "RETENTION_CHECK_INTERVAL_HOURS", 24u64)?;
        let batch_size: usize = parse_or(&lookup, "SWEEP_BATCH_SIZE", MAX_SWEEP_BATCH_SIZE)?;

        if !(1..=MAX_RETENTION_WINDOW_DAYS).contains(&window_days) {
            return Err(AppError::Config(format!(
                "RETENTION_WINDOW_DAYS must be between 1 and {}",
                MAX_RETENTION_WINDOW_DAYS
            )));
        }
        if !(1..=MAX_CHECK_INTERVAL_HOURS).contains(&interval_hours) {
            return Err(AppError::Config(format!(
                "RETENTION_CHECK_INTERVAL_HOURS must be between 1 and {}",
                MAX_CHECK_INTERVAL_HOURS
            )));
        }
        if batch_size == 0 || batch_size > MAX_SWEEP_BATCH_SIZE {
            return Err(AppError::Config(format!(
                "SWEEP_BATCH_SIZE must be between 1 and {}",
                MAX_SWEEP_BATCH_SIZE
            )));
        }

        let window = chrono::Duration::try_days(window_days).ok_or_else(|| {
            AppError::Config("RETENTION_WINDOW_DAYS is out of range".to_string())
        })?;
        let interval_secs = interval_hours.checked_mul(60 * 60).ok_or_else(|| {
            AppError::Config("RETENTION_CHECK_INTERVAL_HOURS is out of range".to_string())
        })?;

        let retention = RetentionConfig {
            window,
            check_interval: Duration::from_secs(interval_secs),
            batch_size,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10u32)?,
            redis_url: lookup("REDIS_URL").filter(|url| !url.is_empty()),
            credentials_path: required("GOOGLE_APPLICATION_CREDENTIALS")?,
            fcm_project_id: lookup("FCM_PROJECT_ID").filter(|id| !id.is_empty()),
            fcm_base_url: lookup("FCM_BASE_URL")
                .unwrap_or_else(|| "https://fcm.googleapis.com".to_string()),
            dispatch,
            retention,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::Config(format!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            ))
        }),
        None => Ok(default),
    }
}
