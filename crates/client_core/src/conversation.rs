use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use e2ee::ConversationKey;
use shared::{
    domain::{ConversationPair, UserId},
    error::ChatError,
    protocol::MessageRecord,
};
use storage::{ConversationStore, Subscription, SubscriptionHandle};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::{
    read_state::mark_conversation_read,
    send::send_sealed,
    transcript::{ConversationState, Transcript, TranscriptEntry},
    ConversationOptions,
};

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Ready { entries: usize },
    Appended(TranscriptEntry),
    /// Rows recovered by re-querying after the live feed dropped.
    Backfilled(Vec<TranscriptEntry>),
    ReadStateChanged { updated: u64 },
    Error(String),
    Closed,
}

/// Text of a send that failed to persist, kept for a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub attachment_url: Option<String>,
}

/// A direct conversation between the local user and one peer.
///
/// Holds the merged transcript and, once loaded, a background task that
/// follows the store's live feed. Dropping or closing it cancels the feed
/// subscription before returning and stops the task.
pub struct Conversation {
    inner: Arc<ConversationInner>,
    feed_task: Option<JoinHandle<()>>,
}

struct ConversationInner {
    local: UserId,
    peer: UserId,
    pair: ConversationPair,
    key: ConversationKey,
    placeholder: String,
    store: Arc<dyn ConversationStore>,
    view: Mutex<View>,
    failed_drafts: Mutex<VecDeque<Draft>>,
    feed: StdMutex<FeedSlot>,
    events: broadcast::Sender<ConversationEvent>,
}

struct View {
    state: ConversationState,
    transcript: Transcript,
}

/// Cancel handle of the subscription the feed task currently polls.
#[derive(Default)]
struct FeedSlot {
    handle: Option<SubscriptionHandle>,
    released: bool,
}

impl Conversation {
    /// An `Empty` conversation; nothing is queried until [`Conversation::load`].
    pub(crate) fn new(
        store: Arc<dyn ConversationStore>,
        local: UserId,
        peer: UserId,
        key: ConversationKey,
        options: &ConversationOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            inner: Arc::new(ConversationInner {
                local,
                peer,
                pair: ConversationPair::new(local, peer),
                key,
                placeholder: options.unreadable_placeholder.clone(),
                store,
                view: Mutex::new(View {
                    state: ConversationState::Empty,
                    transcript: Transcript::new(),
                }),
                failed_drafts: Mutex::new(VecDeque::new()),
                feed: StdMutex::new(FeedSlot::default()),
                events,
            }),
            feed_task: None,
        }
    }

    /// Subscribes, loads the snapshot, then starts following the feed and
    /// marks inbound messages read. A no-op once loaded.
    ///
    /// The subscription is taken before the snapshot query so that a row
    /// inserted in between arrives through the feed; the id set drops it if
    /// the snapshot already had it. A failed query leaves the conversation
    /// `Empty` so the load can be retried.
    pub async fn load(&mut self) -> Result<(), ChatError> {
        let (local, peer) = (self.inner.local, self.inner.peer);
        {
            let mut view = self.inner.view.lock().await;
            match view.state {
                ConversationState::Empty => view.state = ConversationState::Loading,
                ConversationState::Closed => return Err(ChatError::ConversationClosed),
                ConversationState::Loading | ConversationState::Ready => return Ok(()),
            }
        }

        let mut subscription = self.inner.store.subscribe();
        self.inner.attach_feed(subscription.handle());
        let snapshot = match self.inner.store.query(local, peer).await {
            Ok(rows) => rows,
            Err(err) => {
                subscription.cancel();
                error!(%local, %peer, error = %format!("{err:#}"), "transcript: snapshot query failed");
                let mut view = self.inner.view.lock().await;
                if view.state == ConversationState::Loading {
                    view.state = ConversationState::Empty;
                }
                return Err(ChatError::persistence(format!("{err:#}")));
            }
        };

        let loaded = {
            let mut view = self.inner.view.lock().await;
            if view.state != ConversationState::Loading {
                return Err(ChatError::ConversationClosed);
            }
            let inner = &self.inner;
            view.transcript
                .load_snapshot(snapshot.into_iter().map(|record| inner.render(record)));
            view.state = ConversationState::Ready;
            view.transcript.len()
        };
        info!(%local, %peer, entries = loaded, key = %self.inner.key.fingerprint(), "transcript: ready");
        let _ = self
            .inner
            .events
            .send(ConversationEvent::Ready { entries: loaded });

        self.feed_task = Some(tokio::spawn(follow_feed(
            Arc::clone(&self.inner),
            subscription,
        )));
        self.mark_read().await;
        Ok(())
    }

    pub fn local_user(&self) -> UserId {
        self.inner.local
    }

    pub fn peer(&self) -> UserId {
        self.inner.peer
    }

    pub fn key_fingerprint(&self) -> String {
        self.inner.key.fingerprint()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> ConversationState {
        self.inner.view.lock().await.state
    }

    pub async fn entries(&self) -> Vec<TranscriptEntry> {
        self.inner.view.lock().await.transcript.entries().to_vec()
    }

    pub async fn send(&self, text: &str) -> Result<Option<TranscriptEntry>, ChatError> {
        self.send_draft(Draft {
            text: text.to_string(),
            attachment_url: None,
        })
        .await
    }

    /// Sends `text` with an attachment reference stored next to the envelope.
    pub async fn send_attachment(
        &self,
        text: &str,
        attachment_url: &str,
    ) -> Result<Option<TranscriptEntry>, ChatError> {
        self.send_draft(Draft {
            text: text.to_string(),
            attachment_url: Some(attachment_url.to_string()),
        })
        .await
    }

    /// Sends that failed to persist, oldest first.
    pub async fn failed_drafts(&self) -> Vec<Draft> {
        self.inner.failed_drafts.lock().await.iter().cloned().collect()
    }

    /// Re-sends every failed draft in order.
    ///
    /// Stops at the first draft that fails again; it and the ones after it
    /// go back to the front of the queue, ahead of drafts that failed in the
    /// meantime.
    pub async fn retry_failed(&self) -> Result<Vec<TranscriptEntry>, ChatError> {
        let mut pending: VecDeque<Draft> =
            self.inner.failed_drafts.lock().await.drain(..).collect();
        let mut sent = Vec::new();
        while let Some(draft) = pending.pop_front() {
            match self.persist_draft(&draft).await {
                Ok(entry) => sent.extend(entry),
                Err(err) => {
                    pending.push_front(draft);
                    let mut queue = self.inner.failed_drafts.lock().await;
                    while let Some(draft) = pending.pop_back() {
                        queue.push_front(draft);
                    }
                    warn!(queued = queue.len(), error = %err, "send: retry failed; drafts kept");
                    return Err(err);
                }
            }
        }
        Ok(sent)
    }

    /// Marks inbound messages read in the store and in the local transcript.
    pub async fn mark_read(&self) -> u64 {
        let updated =
            mark_conversation_read(self.inner.store.as_ref(), self.inner.local, self.inner.peer)
                .await;
        if updated > 0 {
            let mut view = self.inner.view.lock().await;
            if view.state == ConversationState::Ready {
                view.transcript.mark_inbound_read(self.inner.local);
                let _ = self
                    .inner
                    .events
                    .send(ConversationEvent::ReadStateChanged { updated });
            }
        }
        updated
    }

    /// Cancels the feed subscription, stops the task and discards the
    /// transcript. Idempotent.
    pub async fn close(&mut self) {
        self.inner.release_feed();
        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
        let mut view = self.inner.view.lock().await;
        if view.state == ConversationState::Closed {
            return;
        }
        view.state = ConversationState::Closed;
        view.transcript.clear();
        drop(view);
        info!(local = %self.inner.local, peer = %self.inner.peer, "transcript: closed");
        let _ = self.inner.events.send(ConversationEvent::Closed);
    }

    async fn send_draft(&self, draft: Draft) -> Result<Option<TranscriptEntry>, ChatError> {
        match self.persist_draft(&draft).await {
            Err(err @ ChatError::ConversationClosed) => Err(err),
            Err(err) => {
                self.inner.failed_drafts.lock().await.push_back(draft);
                Err(err)
            }
            sent => sent,
        }
    }

    /// Seals and stores one draft and echoes it into the transcript.
    async fn persist_draft(&self, draft: &Draft) -> Result<Option<TranscriptEntry>, ChatError> {
        if self.state().await == ConversationState::Closed {
            return Err(ChatError::ConversationClosed);
        }

        let record = send_sealed(
            self.inner.store.as_ref(),
            self.inner.local,
            self.inner.peer,
            &draft.text,
            &self.inner.key,
            draft.attachment_url.clone(),
        )
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };
        let entry = TranscriptEntry::echo(record, draft.text.trim());
        self.inner.accept_entry(entry.clone()).await;
        Ok(Some(entry))
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.inner.release_feed();
        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
    }
}

impl ConversationInner {
    fn feed_slot(&self) -> MutexGuard<'_, FeedSlot> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the handle of a new subscription, cancelling the previous
    /// one. Returns false, after cancelling it, once the feed was released.
    fn attach_feed(&self, handle: SubscriptionHandle) -> bool {
        let mut slot = self.feed_slot();
        if slot.released {
            handle.cancel();
            return false;
        }
        if let Some(previous) = slot.handle.replace(handle) {
            previous.cancel();
        }
        true
    }

    fn release_feed(&self) {
        let mut slot = self.feed_slot();
        slot.released = true;
        if let Some(handle) = slot.handle.take() {
            handle.cancel();
        }
    }

    fn render(&self, record: MessageRecord) -> TranscriptEntry {
        TranscriptEntry::render(record, &self.key, &self.placeholder)
    }

    async fn accept_record(&self, record: MessageRecord) {
        if !self.pair.matches(record.sender_id, record.recipient_id) {
            return;
        }
        let mut view = self.view.lock().await;
        if view.state != ConversationState::Ready {
            return;
        }
        if view.transcript.contains(record.id) {
            debug!(message_id = record.id.0, "transcript: duplicate delivery ignored");
            return;
        }
        let entry = self.render(record);
        view.transcript.append(entry.clone());
        let _ = self.events.send(ConversationEvent::Appended(entry));
    }

    async fn accept_entry(&self, entry: TranscriptEntry) {
        let mut view = self.view.lock().await;
        if view.state != ConversationState::Ready {
            return;
        }
        if view.transcript.append(entry.clone()) {
            let _ = self.events.send(ConversationEvent::Appended(entry));
        }
    }

    async fn backfill(&self) {
        let rows = match self.store.query(self.local, self.peer).await {
            Ok(rows) => rows,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(local = %self.local, peer = %self.peer, error = %message, "transcript: backfill failed");
                let _ = self.events.send(ConversationEvent::Error(message));
                return;
            }
        };

        let mut view = self.view.lock().await;
        if view.state != ConversationState::Ready {
            return;
        }
        let unseen: Vec<_> = rows
            .into_iter()
            .filter(|row| !view.transcript.contains(row.id))
            .map(|row| self.render(row))
            .collect();
        let added = view.transcript.backfill(unseen);
        if !added.is_empty() {
            info!(recovered = added.len(), "transcript: backfilled after resubscribe");
            let _ = self.events.send(ConversationEvent::Backfilled(added));
        }
    }
}

async fn follow_feed(inner: Arc<ConversationInner>, mut subscription: Subscription) {
    while let Some(event) = subscription.next().await {
        match event {
            Ok(record) => inner.accept_record(record).await,
            Err(err) => {
                warn!(error = %err, "transcript: live feed interrupted; resubscribing");
                subscription.cancel();
                subscription = inner.store.subscribe();
                if !inner.attach_feed(subscription.handle()) {
                    break;
                }
                inner.backfill().await;
            }
        }
    }
    debug!(local = %inner.local, peer = %inner.peer, "transcript: live feed ended");
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
