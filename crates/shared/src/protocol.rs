use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationPair, MessageId, UserId};

/// Canonical `messages` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    /// Envelope text when `encrypted`, otherwise legacy plaintext.
    pub content: String,
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

fn default_encrypted() -> bool {
    true
}

impl MessageRecord {
    pub fn pair(&self) -> ConversationPair {
        ConversationPair::new(self.sender_id, self.recipient_id)
    }

    /// Transcript ordering key.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

/// A row about to be inserted; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_rows_without_encryption_flag_default_to_encrypted() {
        let sender = UserId::random();
        let recipient = UserId::random();
        let raw = serde_json::json!({
            "id": 7,
            "sender_id": sender,
            "recipient_id": recipient,
            "content": "opaque",
            "created_at": "2024-05-01T10:00:00Z",
        });
        let record: MessageRecord = serde_json::from_value(raw).expect("decode");
        assert!(record.encrypted);
        assert!(!record.is_read);
        assert_eq!(record.attachment_url, None);
        assert_eq!(record.pair(), ConversationPair::new(recipient, sender));
    }

    #[test]
    fn membership_filter_ignores_direction_only() {
        let a = UserId::random();
        let b = UserId::random();
        let c = UserId::random();
        let pair = ConversationPair::new(a, b);
        assert!(pair.matches(a, b));
        assert!(pair.matches(b, a));
        assert!(!pair.matches(a, c));
        assert!(!pair.matches(a, a));
    }
}
