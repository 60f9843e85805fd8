//! Provider message construction.
//!
//! Turns a queue entry into the FCM v1 `message` object: target token, display
//! fields, custom data and the per-platform delivery hints the mobile app expects
//! (high priority and default sound everywhere, the app's Android channel, and a
//! badge of 1 with a title/body alert on APNs).

use std::collections::HashMap;

use serde::Serialize;

use pushq_common::types::{NotificationContent, QueueEntry};

const DEFAULT_SOUND: &str = "default";
const APNS_BADGE: u32 = 1;

/// A message ready for the push gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    /// Destination device token.
    pub token: String,
    pub notification: NotificationContent,
    /// Custom key/value payload delivered to the app.
    pub data: HashMap<String, String>,
    pub android: AndroidConfig,
    pub apns: ApnsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AndroidConfig {
    /// `"high"` wakes the device immediately.
    pub priority: String,
    pub notification: AndroidNotification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AndroidNotification {
    pub sound: String,
    pub channel_id: String,
    pub notification_priority: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApnsConfig {
    pub payload: ApnsPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApnsPayload {
    pub aps: Aps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aps {
    pub sound: String,
    pub badge: u32,
    pub alert: NotificationContent,
}

impl PushMessage {
    /// Build the message for `entry`. Pure: no I/O, the entry is not modified.
    pub fn for_entry(entry: &QueueEntry, android_channel_id: &str) -> Self {
        Self {
            token: entry.token.clone(),
            notification: entry.notification.clone(),
            data: entry.data.clone(),
            android: AndroidConfig {
                priority: "high".to_string(),
                notification: AndroidNotification {
                    sound: DEFAULT_SOUND.to_string(),
                    channel_id: android_channel_id.to_string(),
                    notification_priority: "PRIORITY_HIGH".to_string(),
                },
            },
            apns: ApnsConfig {
                payload: ApnsPayload {
                    aps: Aps {
                        sound: DEFAULT_SOUND.to_string(),
                        badge: APNS_BADGE,
                        alert: entry.notification.clone(),
                    },
                },
            },
        }
    }

    /// The request body for `messages:send`.
    pub fn to_send_request(&self) -> serde_json::Value {
        serde_json::json!({ "message": self })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushq_common::types::NewQueueEntry;
    use uuid::Uuid;

    fn entry_with_data(data: HashMap<String, String>) -> QueueEntry {
        NewQueueEntry::pending("T1", "Hi", "B")
            .with_data(data)
            .into_entry(Uuid::new_v4())
    }

    #[test]
    fn test_message_carries_target_and_display_fields() {
        let entry = entry_with_data(HashMap::new());
        let message = PushMessage::for_entry(&entry, "getcars_channel");

        assert_eq!(message.token, "T1");
        assert_eq!(message.notification.title, "Hi");
        assert_eq!(message.notification.body, "B");
        assert!(message.data.is_empty());
    }

    #[test]
    fn test_platform_hints() {
        let entry = entry_with_data(HashMap::new());
        let message = PushMessage::for_entry(&entry, "getcars_channel");

        assert_eq!(message.android.priority, "high");
        assert_eq!(message.android.notification.sound, "default");
        assert_eq!(message.android.notification.channel_id, "getcars_channel");
        assert_eq!(message.apns.payload.aps.sound, "default");
        assert_eq!(message.apns.payload.aps.badge, 1);
        assert_eq!(message.apns.payload.aps.alert, entry.notification);
    }

    #[test]
    fn test_custom_data_is_forwarded() {
        let data = HashMap::from([
            ("listingId".to_string(), "42".to_string()),
            ("type".to_string(), "offer".to_string()),
        ]);
        let entry = entry_with_data(data.clone());
        let message = PushMessage::for_entry(&entry, "getcars_channel");
        assert_eq!(message.data, data);
    }

    #[test]
    fn test_send_request_shape() {
        let entry = entry_with_data(HashMap::from([("k".to_string(), "v".to_string())]));
        let body = PushMessage::for_entry(&entry, "getcars_channel").to_send_request();

        let message = &body["message"];
        assert_eq!(message["token"], "T1");
        assert_eq!(message["notification"]["title"], "Hi");
        assert_eq!(message["data"]["k"], "v");
        assert_eq!(message["android"]["priority"], "high");
        assert_eq!(message["android"]["notification"]["channel_id"], "getcars_channel");
        assert_eq!(message["apns"]["payload"]["aps"]["badge"], 1);
        assert_eq!(message["apns"]["payload"]["aps"]["alert"]["body"], "B");
        // badge is an APNs-only hint
        assert!(message["android"].get("badge").is_none());
        assert!(message["android"]["notification"].get("badge").is_none());
    }
}
