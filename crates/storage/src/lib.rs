use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::{MessageRecord, NewMessage},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info};

mod memory;
mod subscription;

pub use memory::MemoryStore;
pub use subscription::{Subscription, SubscriptionHandle};

pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Backing store for direct-message rows.
///
/// `subscribe` is a feed of every insert made through this adapter, across
/// all conversations; callers filter by participant pair themselves.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Point-in-time snapshot of the `{a, b}` conversation ordered by `(created_at, id)`.
    async fn query(&self, a: UserId, b: UserId) -> Result<Vec<MessageRecord>>;
    fn subscribe(&self) -> Subscription;
    /// Persists one row, assigning `id` and `created_at`. Nothing is written on error.
    async fn insert(&self, message: NewMessage) -> Result<MessageRecord>;
    /// Flags unread rows sent by `counterpart` to `owner`; returns how many changed.
    async fn mark_read(&self, owner: UserId, counterpart: UserId) -> Result<u64>;
    async fn unread_count(&self, owner: UserId, counterpart: UserId) -> Result<u64>;
}

/// Published X25519 public keys used for per-pair key agreement.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn publish_public_key(&self, user_id: UserId, public_key_b64: &str) -> Result<()>;
    async fn public_key(&self, user_id: UserId) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    events: broadcast::Sender<MessageRecord>,
    clock: Arc<InsertClock>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_feed_capacity(database_url, DEFAULT_FEED_CAPACITY).await
    }

    pub async fn with_feed_capacity(database_url: &str, feed_capacity: usize) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own empty schema.
        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let latest: Option<String> = sqlx::query_scalar("SELECT MAX(created_at) FROM messages")
            .fetch_one(&pool)
            .await
            .context("failed to read latest message timestamp")?;
        let seed = latest
            .as_deref()
            .map(parse_timestamp)
            .transpose()?
            .map(|ts| ts.timestamp_micros())
            .unwrap_or_default();

        let (events, _) = broadcast::channel(feed_capacity.max(1));
        info!(%database_url, feed_capacity, "store: sqlite adapter ready");
        Ok(Self {
            pool,
            events,
            clock: Arc::new(InsertClock::seeded(seed)),
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            "SELECT id, sender_id, recipient_id, content, encrypted, attachment_url, created_at, is_read
             FROM messages
             WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Shuts the pool down; live subscriptions end once their buffered events drain.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("store: sqlite adapter closed");
    }
}

#[async_trait]
impl ConversationStore for Storage {
    async fn query(&self, a: UserId, b: UserId) -> Result<Vec<MessageRecord>> {
        let (a, b) = (a.to_string(), b.to_string());
        let rows = sqlx::query(
            "SELECT id, sender_id, recipient_id, content, encrypted, attachment_url, created_at, is_read
             FROM messages
             WHERE (sender_id = ? AND recipient_id = ?) OR (sender_id = ? AND recipient_id = ?)
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&a)
        .bind(&b)
        .bind(&b)
        .bind(&a)
        .fetch_all(&self.pool)
        .await
        .context("failed to query conversation")?;

        rows.iter().map(record_from_row).collect()
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    async fn insert(&self, message: NewMessage) -> Result<MessageRecord> {
        let created_at = self.clock.next();
        let rec = sqlx::query(
            "INSERT INTO messages (sender_id, recipient_id, content, encrypted, attachment_url, created_at, is_read)
             VALUES (?, ?, ?, ?, ?, ?, 0)
             RETURNING id",
        )
        .bind(message.sender_id.to_string())
        .bind(message.recipient_id.to_string())
        .bind(&message.content)
        .bind(message.encrypted)
        .bind(message.attachment_url.as_deref())
        .bind(format_timestamp(created_at))
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;

        let record = MessageRecord {
            id: MessageId(rec.get::<i64, _>(0)),
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            encrypted: message.encrypted,
            attachment_url: message.attachment_url,
            created_at,
            is_read: false,
        };
        debug!(message_id = record.id.0, "store: message inserted");
        let _ = self.events.send(record.clone());
        Ok(record)
    }

    async fn mark_read(&self, owner: UserId, counterpart: UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1
             WHERE recipient_id = ? AND sender_id = ? AND is_read = 0",
        )
        .bind(owner.to_string())
        .bind(counterpart.to_string())
        .execute(&self.pool)
        .await
        .context("failed to mark messages read")?;
        Ok(result.rows_affected())
    }

    async fn unread_count(&self, owner: UserId, counterpart: UserId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE recipient_id = ? AND sender_id = ? AND is_read = 0",
        )
        .bind(owner.to_string())
        .bind(counterpart.to_string())
        .fetch_one(&self.pool)
        .await
        .context("failed to count unread messages")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl KeyDirectory for Storage {
    async fn publish_public_key(&self, user_id: UserId, public_key_b64: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO public_keys (user_id, public_key_b64, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET public_key_b64=excluded.public_key_b64, updated_at=excluded.updated_at",
        )
        .bind(user_id.to_string())
        .bind(public_key_b64)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .context("failed to publish public key")?;
        Ok(())
    }

    async fn public_key(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT public_key_b64 FROM public_keys WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }
}

/// Hands out strictly increasing `created_at` values for one adapter.
#[derive(Debug, Default)]
pub(crate) struct InsertClock {
    last_micros: AtomicI64,
}

impl InsertClock {
    pub(crate) fn seeded(last_micros: i64) -> Self {
        Self {
            last_micros: AtomicI64::new(last_micros),
        }
    }

    pub(crate) fn next(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let previous = self
            .last_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        DateTime::<Utc>::from_timestamp_micros(now.max(previous + 1)).unwrap_or_else(Utc::now)
    }
}

// Fixed-width UTC text so lexical order in SQLite equals chronological order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

fn parse_user(raw: &str) -> Result<UserId> {
    UserId::parse(raw).with_context(|| format!("invalid stored participant id '{raw}'"))
}

fn record_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId(row.try_get("id")?),
        sender_id: parse_user(&row.try_get::<String, _>("sender_id")?)?,
        recipient_id: parse_user(&row.try_get::<String, _>("recipient_id")?)?,
        content: row.try_get("content")?,
        encrypted: row.try_get("encrypted")?,
        attachment_url: row.try_get("attachment_url")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        is_read: row.try_get("is_read")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn is_in_memory(database_url: &str) -> bool {
    database_url == "sqlite::memory:" || database_url.contains("mode=memory")
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
