use thiserror::Error;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// Another dispatch holds the entry's claim. Retry once the claim can have lapsed.
    #[error("Claim held: {0}")]
    ClaimHeld(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry of the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)
            ),
            AppError::Redis(_) | AppError::ClaimHeld(_) | AppError::Internal(_) => true,
            AppError::Config(_) | AppError::Decode(_) => false,
        }
    }
}
