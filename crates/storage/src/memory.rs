use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationPair, MessageId, UserId},
    protocol::{MessageRecord, NewMessage},
};
use tokio::sync::{broadcast, Mutex};

use crate::{
    ConversationStore, InsertClock, KeyDirectory, Subscription, DEFAULT_FEED_CAPACITY,
};

/// In-process store with the same contract as [`crate::Storage`].
///
/// Write failures can be switched on to exercise the error paths of callers.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<MessageRecord>,
    clock: InsertClock,
    fail_writes: AtomicBool,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<MessageRecord>,
    next_id: i64,
    public_keys: HashMap<UserId, String>,
    read_mutations: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(feed_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            clock: InsertClock::default(),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes `insert` and `mark_read` fail until switched back off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Total number of rows whose `is_read` flag was changed.
    pub async fn read_mutations(&self) -> u64 {
        self.state.lock().await.read_mutations
    }

    /// Receivers currently attached to the insert feed.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub async fn rows(&self) -> Vec<MessageRecord> {
        self.state.lock().await.rows.clone()
    }

    /// Pushes an already stored row onto the feed again, as a late or
    /// duplicated notification would.
    pub async fn redeliver(&self, message_id: MessageId) -> Result<()> {
        let record = self
            .state
            .lock()
            .await
            .rows
            .iter()
            .find(|row| row.id == message_id)
            .cloned()
            .ok_or_else(|| anyhow!("message {} not found", message_id.0))?;
        let _ = self.events.send(record);
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("memory store is rejecting writes");
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn query(&self, a: UserId, b: UserId) -> Result<Vec<MessageRecord>> {
        let pair = ConversationPair::new(a, b);
        let mut rows: Vec<MessageRecord> = self
            .state
            .lock()
            .await
            .rows
            .iter()
            .filter(|row| pair.matches(row.sender_id, row.recipient_id))
            .cloned()
            .collect();
        rows.sort_by_key(MessageRecord::order_key);
        Ok(rows)
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    async fn insert(&self, message: NewMessage) -> Result<MessageRecord> {
        self.check_writable()?;
        let record = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let record = MessageRecord {
                id: MessageId(state.next_id),
                sender_id: message.sender_id,
                recipient_id: message.recipient_id,
                content: message.content,
                encrypted: message.encrypted,
                attachment_url: message.attachment_url,
                created_at: self.clock.next(),
                is_read: false,
            };
            state.rows.push(record.clone());
            record
        };
        let _ = self.events.send(record.clone());
        Ok(record)
    }

    async fn mark_read(&self, owner: UserId, counterpart: UserId) -> Result<u64> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for row in state
            .rows
            .iter_mut()
            .filter(|row| row.recipient_id == owner && row.sender_id == counterpart && !row.is_read)
        {
            row.is_read = true;
            updated += 1;
        }
        state.read_mutations += updated;
        Ok(updated)
    }

    async fn unread_count(&self, owner: UserId, counterpart: UserId) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .filter(|row| row.recipient_id == owner && row.sender_id == counterpart && !row.is_read)
            .count() as u64)
    }
}

#[async_trait]
impl KeyDirectory for MemoryStore {
    async fn publish_public_key(&self, user_id: UserId, public_key_b64: &str) -> Result<()> {
        self.check_writable()?;
        self.state
            .lock()
            .await
            .public_keys
            .insert(user_id, public_key_b64.to_string());
        Ok(())
    }

    async fn public_key(&self, user_id: UserId) -> Result<Option<String>> {
        Ok(self.state.lock().await.public_keys.get(&user_id).cloned())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
