use std::collections::HashSet;

use e2ee::{open_text, ConversationKey};
use shared::{
    domain::{MessageId, UserId},
    protocol::MessageRecord,
};
use tracing::warn;

pub const UNREADABLE_PLACEHOLDER: &str = "[unreadable message]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Empty,
    Loading,
    Ready,
    Closed,
}

/// One decrypted row as shown in a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    /// The row as stored; `content` is still the envelope for encrypted rows.
    pub record: MessageRecord,
    pub text: String,
    /// False when `text` is the placeholder for a row that failed to open.
    pub readable: bool,
}

impl TranscriptEntry {
    /// Opens `record` with `key`. Unreadable rows get `placeholder` instead of failing.
    pub fn render(record: MessageRecord, key: &ConversationKey, placeholder: &str) -> Self {
        if !record.encrypted {
            return Self {
                text: record.content.clone(),
                readable: true,
                record,
            };
        }

        match open_text(key, &record.content) {
            Ok(text) => Self {
                record,
                text,
                readable: true,
            },
            Err(err) => {
                warn!(
                    message_id = record.id.0,
                    error = %err,
                    "transcript: decrypt failed; rendering placeholder"
                );
                Self {
                    record,
                    text: placeholder.to_string(),
                    readable: false,
                }
            }
        }
    }

    /// Entry for a row this client just sealed, without reopening it.
    pub(crate) fn echo(record: MessageRecord, plaintext: impl Into<String>) -> Self {
        Self {
            record,
            text: plaintext.into(),
            readable: true,
        }
    }

    pub fn id(&self) -> MessageId {
        self.record.id
    }

    pub fn is_from(&self, user: UserId) -> bool {
        self.record.sender_id == user
    }
}

/// Ordered transcript plus the set of ids it already holds.
///
/// Every path that adds entries goes through the id set, so a row that
/// arrives from the snapshot, the live feed and the send echo is kept once.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    seen: HashSet<MessageId>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents with a historical snapshot, ordered by `(created_at, id)`.
    pub fn load_snapshot(&mut self, entries: impl IntoIterator<Item = TranscriptEntry>) {
        self.clear();
        for entry in entries {
            if self.seen.insert(entry.id()) {
                self.entries.push(entry);
            }
        }
        self.entries.sort_by_key(|entry| entry.record.order_key());
    }

    /// Appends at the end without reordering. Returns false for a known id.
    pub fn append(&mut self, entry: TranscriptEntry) -> bool {
        if !self.seen.insert(entry.id()) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Inserts unseen entries at their ordered position; returns the ones added.
    pub fn backfill(
        &mut self,
        entries: impl IntoIterator<Item = TranscriptEntry>,
    ) -> Vec<TranscriptEntry> {
        let mut added = Vec::new();
        for entry in entries {
            if !self.seen.insert(entry.id()) {
                continue;
            }
            let key = entry.record.order_key();
            let position = self
                .entries
                .partition_point(|existing| existing.record.order_key() <= key);
            self.entries.insert(position, entry.clone());
            added.push(entry);
        }
        added
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flags rows addressed to `owner` as read. Never clears the flag.
    pub fn mark_inbound_read(&mut self, owner: UserId) -> usize {
        let mut updated = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|entry| entry.record.recipient_id == owner && !entry.record.is_read)
        {
            entry.record.is_read = true;
            updated += 1;
        }
        updated
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
#[path = "tests/transcript_tests.rs"]
mod tests;
