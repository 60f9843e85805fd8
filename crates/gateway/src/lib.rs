//! Push gateway capability.
//!
//! The dispatcher only sees [`PushGateway`]: hand it a [`PushMessage`], get back the
//! provider's delivery id or a [`GatewayError`]. [`fcm::FcmGateway`] implements it on
//! top of the FCM HTTP v1 API.

pub mod auth;
pub mod fcm;
pub mod message;

use std::time::Duration;

use async_trait::async_trait;

pub use fcm::FcmGateway;
pub use message::PushMessage;

/// Errors returned by a push gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// HTTP transport failure.
    #[error("push gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The provider refused the message (invalid token, quota, malformed payload...).
    /// Displays as the provider's own message.
    #[error("{message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Provider error code, e.g. `UNREGISTERED`.
        code: Option<String>,
        /// Human-readable provider message.
        message: String,
    },

    /// Obtaining an access token failed.
    #[error("push gateway authentication failed: {0}")]
    Auth(String),

    /// Response did not match the expected schema.
    #[error("push gateway response parse error: {0}")]
    Parse(String),

    /// The send did not complete in time.
    #[error("push gateway timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The gateway cannot take sends with its current configuration.
    #[error("push gateway unavailable: {0}")]
    Unavailable(String),
}

/// Delivers one message to one device.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Send `message`, returning the provider-assigned message id.
    async fn send(&self, message: &PushMessage) -> Result<String, GatewayError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
