use std::{
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use shared::{error::ChatError, protocol::MessageRecord};
use tokio::sync::broadcast;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream,
};
use tracing::debug;

type Feed = Arc<Mutex<Option<BroadcastStream<MessageRecord>>>>;

/// Handle on the store-wide insert feed.
///
/// Yields every inserted row in store order. Once [`Subscription::cancel`]
/// (or [`SubscriptionHandle::cancel`]) returns, the receiver is gone and the
/// stream yields `None`; it never restarts. A receiver that falls behind
/// yields a single [`ChatError::Subscription`] and then keeps going from the
/// oldest event still buffered.
pub struct Subscription {
    feed: Feed,
}

/// Cancels a [`Subscription`] from outside the task that polls it.
#[derive(Clone)]
pub struct SubscriptionHandle {
    feed: Feed,
}

impl Subscription {
    pub(crate) fn new(receiver: broadcast::Receiver<MessageRecord>) -> Self {
        Self {
            feed: Arc::new(Mutex::new(Some(BroadcastStream::new(receiver)))),
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            feed: Arc::clone(&self.feed),
        }
    }

    pub fn cancel(&mut self) {
        cancel_feed(&self.feed);
    }

    pub fn is_cancelled(&self) -> bool {
        lock_feed(&self.feed).is_none()
    }
}

impl SubscriptionHandle {
    /// Drops the underlying receiver before returning.
    pub fn cancel(&self) {
        cancel_feed(&self.feed);
    }

    pub fn is_cancelled(&self) -> bool {
        lock_feed(&self.feed).is_none()
    }
}

fn lock_feed(feed: &Feed) -> MutexGuard<'_, Option<BroadcastStream<MessageRecord>>> {
    feed.lock().unwrap_or_else(PoisonError::into_inner)
}

fn cancel_feed(feed: &Feed) {
    if lock_feed(feed).take().is_some() {
        debug!("store: subscription cancelled");
    }
}

impl Stream for Subscription {
    type Item = Result<MessageRecord, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut guard = lock_feed(&self.feed);
        let Some(feed) = guard.as_mut() else {
            return Poll::Ready(None);
        };
        Pin::new(feed).poll_next(cx).map(|item| {
            item.map(|event| {
                event.map_err(|BroadcastStreamRecvError::Lagged(skipped)| {
                    ChatError::Subscription(format!("feed lagged; {skipped} inserts were dropped"))
                })
            })
        })
    }
}
