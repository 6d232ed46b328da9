use e2ee::{derive_key, open_text, seal, KeyMaterial};
use futures::StreamExt;
use shared::{domain::UserId, protocol::NewMessage};
use storage::{ConversationStore, Storage};

#[tokio::test]
async fn sealed_rows_round_trip_through_sqlite_and_feed() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = UserId::random();
    let bob = UserId::random();
    let key = derive_key(alice, bob, &KeyMaterial::passphrase("hunter2")).expect("key");
    let mut feed = storage.subscribe();

    let envelope = seal(&key, b"hello").expect("seal");
    let stored = storage
        .insert(NewMessage {
            sender_id: alice,
            recipient_id: bob,
            content: envelope.into_string(),
            encrypted: true,
            attachment_url: Some("https://files.example/voice_1.webm".into()),
        })
        .await
        .expect("insert");

    assert_ne!(stored.content, "hello");
    assert!(!stored.content.contains("hello"));

    let pushed = feed.next().await.expect("event").expect("ok");
    assert_eq!(pushed, stored);

    let bob_key = derive_key(bob, alice, &KeyMaterial::passphrase("hunter2")).expect("key");
    let history = storage.query(bob, alice).await.expect("query");
    assert_eq!(history.len(), 1);
    assert_eq!(open_text(&bob_key, &history[0].content).expect("open"), "hello");
    assert_eq!(
        history[0].attachment_url.as_deref(),
        Some("https://files.example/voice_1.webm")
    );
}
