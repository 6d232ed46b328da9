use super::*;
use tokio_stream::StreamExt;

fn new_message(sender: UserId, recipient: UserId, content: &str) -> NewMessage {
    NewMessage {
        sender_id: sender,
        recipient_id: recipient,
        content: content.to_string(),
        encrypted: false,
        attachment_url: None,
    }
}

#[tokio::test]
async fn failed_insert_writes_nothing_and_publishes_nothing() {
    let store = MemoryStore::new();
    let alice = UserId::random();
    let bob = UserId::random();
    let mut feed = store.subscribe();

    store.fail_writes(true);
    store
        .insert(new_message(alice, bob, "lost"))
        .await
        .expect_err("write should fail");
    assert!(store.rows().await.is_empty());

    store.fail_writes(false);
    let kept = store
        .insert(new_message(alice, bob, "kept"))
        .await
        .expect("insert");
    assert_eq!(feed.next().await.expect("event").expect("ok"), kept);
}

#[tokio::test]
async fn redeliver_replays_an_existing_row() {
    let store = MemoryStore::new();
    let alice = UserId::random();
    let bob = UserId::random();
    let stored = store
        .insert(new_message(alice, bob, "hi"))
        .await
        .expect("insert");

    let mut feed = store.subscribe();
    store.redeliver(stored.id).await.expect("redeliver");
    assert_eq!(feed.next().await.expect("event").expect("ok"), stored);

    store
        .redeliver(MessageId(999))
        .await
        .expect_err("unknown id");
}

#[tokio::test]
async fn read_mutations_count_only_real_flips() {
    let store = MemoryStore::new();
    let alice = UserId::random();
    let bob = UserId::random();
    store
        .insert(new_message(bob, alice, "1"))
        .await
        .expect("insert");

    assert_eq!(store.mark_read(alice, bob).await.expect("mark"), 1);
    assert_eq!(store.mark_read(alice, bob).await.expect("mark"), 0);
    assert_eq!(store.read_mutations().await, 1);
}

#[tokio::test]
async fn lagging_subscriber_reports_subscription_error() {
    let store = MemoryStore::with_feed_capacity(1);
    let alice = UserId::random();
    let bob = UserId::random();
    let mut feed = store.subscribe();

    for text in ["1", "2", "3"] {
        store
            .insert(new_message(alice, bob, text))
            .await
            .expect("insert");
    }

    let err = feed.next().await.expect("event").expect_err("lagged");
    assert!(matches!(err, shared::error::ChatError::Subscription(_)));
    let latest = feed.next().await.expect("event").expect("ok");
    assert_eq!(latest.content, "3");
}

#[tokio::test]
async fn handle_cancel_releases_the_receiver_immediately() {
    let store = MemoryStore::new();
    let mut feed = store.subscribe();
    let handle = feed.handle();
    assert_eq!(store.subscriber_count(), 1);

    handle.cancel();
    assert_eq!(store.subscriber_count(), 0);
    assert!(handle.is_cancelled());
    assert!(feed.is_cancelled());

    store
        .insert(new_message(UserId::random(), UserId::random(), "late"))
        .await
        .expect("insert");
    assert!(feed.next().await.is_none());
    handle.cancel();
}
