//! Wire-format types for the notification event channel.
//!
//! Inbound messages are a discriminated union on `type`. Unrecognized
//! types are preserved as [`ServerEvent::Other`] rather than dropped, so
//! new server-side event kinds still reach subscribers.

use serde::{Deserialize, Serialize};

// ── Notification ─────────────────────────────────────────────────────

/// A single portal notification.
///
/// Uses `#[serde(flatten)]` to capture all fields beyond the core set,
/// so nothing from the backend is silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,

    /// Short display title, e.g. `"Lab results ready"`.
    pub title: String,

    /// Longer body text, if present.
    #[serde(default)]
    pub body: Option<String>,

    /// Severity hint: `"info"`, `"warning"`, `"urgent"`.
    #[serde(default)]
    pub severity: Option<String>,

    /// ISO-8601 creation timestamp from the backend.
    #[serde(default, rename = "createdAt")]
    pub created_at: Option<String>,

    #[serde(default)]
    pub read: bool,

    /// All remaining fields the backend sends.
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

// ── Inbound events (server → client) ─────────────────────────────────

/// A parsed event from the notification channel.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new notification was created for this user.
    NewNotification { notification: Notification },

    /// The server pushed an authoritative unread count.
    NotificationCount { count: u64 },

    /// An event type this client does not recognize. Fanned out to
    /// subscribers untouched; never applied to the cache.
    Other {
        kind: String,
        payload: serde_json::Value,
    },
}

impl ServerEvent {
    /// Parse a text frame into an event.
    ///
    /// Returns `None` for frames that are not JSON objects or carry no
    /// `type` field -- callers log and drop those. A recognized `type`
    /// whose payload fails to deserialize is also treated as malformed.
    pub fn parse(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let kind = value.get("type")?.as_str()?.to_owned();

        match kind.as_str() {
            "NEW_NOTIFICATION" => {
                let notification =
                    serde_json::from_value(value.get("notification")?.clone()).ok()?;
                Some(Self::NewNotification { notification })
            }
            "NOTIFICATION_COUNT" => {
                let count = value.get("count")?.as_u64()?;
                Some(Self::NotificationCount { count })
            }
            _ => Some(Self::Other {
                kind,
                payload: value,
            }),
        }
    }
}

// ── Outbound messages (client → server) ──────────────────────────────

/// A message the client may send over the channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "MARK_READ")]
    MarkRead {
        #[serde(rename = "notificationId")]
        notification_id: i64,
    },

    #[serde(rename = "MARK_ALL_READ")]
    MarkAllRead,
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_new_notification() {
        let raw = serde_json::json!({
            "type": "NEW_NOTIFICATION",
            "notification": {
                "id": 42,
                "title": "Lab results ready",
                "body": "Your CBC panel is available",
                "severity": "info",
                "createdAt": "2026-08-01T09:30:00Z",
                "labOrderId": 9001
            }
        });

        let event = ServerEvent::parse(&raw.to_string()).expect("should parse");
        let ServerEvent::NewNotification { notification } = event else {
            panic!("wrong variant: {event:?}");
        };
        assert_eq!(notification.id, 42);
        assert_eq!(notification.title, "Lab results ready");
        assert_eq!(notification.severity.as_deref(), Some("info"));
        assert!(!notification.read);
        // Extra fields land in `extra`
        assert_eq!(notification.extra["labOrderId"], 9001);
    }

    #[test]
    fn parse_notification_count() {
        let event = ServerEvent::parse(r#"{"type":"NOTIFICATION_COUNT","count":3}"#)
            .expect("should parse");
        let ServerEvent::NotificationCount { count } = event else {
            panic!("wrong variant: {event:?}");
        };
        assert_eq!(count, 3);
    }

    #[test]
    fn unknown_type_becomes_other() {
        let raw = r#"{"type":"APPOINTMENT_REMINDER","appointmentId":7}"#;
        let event = ServerEvent::parse(raw).expect("should parse");
        let ServerEvent::Other { kind, payload } = event else {
            panic!("wrong variant: {event:?}");
        };
        assert_eq!(kind, "APPOINTMENT_REMINDER");
        assert_eq!(payload["appointmentId"], 7);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(ServerEvent::parse("not json at all").is_none());
        assert!(ServerEvent::parse(r#"{"count":3}"#).is_none());
        assert!(ServerEvent::parse(r#"{"type":"NOTIFICATION_COUNT"}"#).is_none());
        assert!(
            ServerEvent::parse(r#"{"type":"NEW_NOTIFICATION","notification":{"title":"x"}}"#)
                .is_none(),
            "notification without an id should be malformed"
        );
    }

    #[test]
    fn serialize_mark_read() {
        let msg = ClientMessage::MarkRead {
            notification_id: 17,
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json, serde_json::json!({"type":"MARK_READ","notificationId":17}));
    }

    #[test]
    fn serialize_mark_all_read() {
        let json = serde_json::to_value(ClientMessage::MarkAllRead).expect("serialize");
        assert_eq!(json, serde_json::json!({"type":"MARK_ALL_READ"}));
    }
}
