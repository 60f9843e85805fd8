use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Name of the queue collection. Part of the wire contract with producers.
pub const QUEUE_COLLECTION: &str = "fcm_queue";

/// Delivery status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sent,
    Failed,
}

impl QueueStatus {
    /// `sent` and `failed` never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "sent" => Ok(QueueStatus::Sent),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(AppError::Decode(format!("Unknown queue status '{}'", other))),
        }
    }
}

/// Display payload shown on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
}

/// One notification delivery attempt, as stored in the queue.
///
/// Serializes with the document field names producers write
/// (`createdAt`, `sentAt`, `failedAt`, `messageId`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: Uuid,
    pub status: QueueStatus,
    pub token: String,
    pub notification: NotificationContent,
    #[serde(default)]
    pub data: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueEntry {
    pub fn is_pending(&self) -> bool {
        self.status == QueueStatus::Pending
    }

    /// Apply a terminal outcome in place.
    ///
    /// Returns `false` and leaves the entry untouched when it is no longer pending.
    pub fn apply_outcome(&mut self, outcome: &DeliveryOutcome) -> bool {
        if !self.is_pending() {
            return false;
        }

        match outcome {
            DeliveryOutcome::Sent { message_id, at } => {
                self.status = QueueStatus::Sent;
                self.message_id = Some(message_id.clone());
                self.sent_at = Some(*at);
            }
            DeliveryOutcome::Failed { error, at } => {
                self.status = QueueStatus::Failed;
                self.error = Some(error.clone());
                self.failed_at = Some(*at);
            }
        }
        true
    }
}

/// A queue entry as written by a producer, before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQueueEntry {
    pub token: String,
    pub notification: NotificationContent,
    #[serde(default)]
    pub data: HashMap<String, String>,
    #[serde(default = "pending_status")]
    pub status: QueueStatus,
    pub created_at: Option<DateTime<Utc>>,
}

fn pending_status() -> QueueStatus {
    QueueStatus::Pending
}

impl NewQueueEntry {
    /// A pending request created now.
    pub fn pending(
        token: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            notification: NotificationContent {
                title: title.into(),
                body: body.into(),
            },
            data: HashMap::new(),
            status: QueueStatus::Pending,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_data(mut self, data: HashMap<String, String>) -> Self {
        self.data = data;
        self
    }

    pub fn with_status(mut self, status: QueueStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn into_entry(self, id: Uuid) -> QueueEntry {
        QueueEntry {
            id,
            status: self.status,
            token: self.token,
            notification: self.notification,
            data: self.data,
            created_at: self.created_at,
            sent_at: None,
            failed_at: None,
            message_id: None,
            error: None,
        }
    }
}

/// Terminal result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { message_id: String, at: DateTime<Utc> },
    Failed { error: String, at: DateTime<Utc> },
}

impl DeliveryOutcome {
    pub fn status(&self) -> QueueStatus {
        match self {
            DeliveryOutcome::Sent { .. } => QueueStatus::Sent,
            DeliveryOutcome::Failed { .. } => QueueStatus::Failed,
        }
    }
}
