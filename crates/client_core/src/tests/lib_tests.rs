use anyhow::{bail, Result};
use async_trait::async_trait;
use shared::protocol::{MessageRecord, NewMessage};
use storage::{MemoryStore, Subscription};

use super::*;

fn passphrase(value: &str) -> KeySource {
    KeySource::Passphrase(Zeroizing::new(value.into()))
}

/// Conversation rows from a [`MemoryStore`], but every key lookup fails.
struct BrokenDirectory {
    rows: MemoryStore,
}

#[async_trait]
impl ConversationStore for BrokenDirectory {
    async fn query(&self, a: UserId, b: UserId) -> Result<Vec<MessageRecord>> {
        self.rows.query(a, b).await
    }

    fn subscribe(&self) -> Subscription {
        self.rows.subscribe()
    }

    async fn insert(&self, message: NewMessage) -> Result<MessageRecord> {
        self.rows.insert(message).await
    }

    async fn mark_read(&self, owner: UserId, counterpart: UserId) -> Result<u64> {
        self.rows.mark_read(owner, counterpart).await
    }

    async fn unread_count(&self, owner: UserId, counterpart: UserId) -> Result<u64> {
        self.rows.unread_count(owner, counterpart).await
    }
}

#[async_trait]
impl KeyDirectory for BrokenDirectory {
    async fn publish_public_key(&self, _user_id: UserId, _public_key_b64: &str) -> Result<()> {
        bail!("key directory offline")
    }

    async fn public_key(&self, _user_id: UserId) -> Result<Option<String>> {
        bail!("key directory offline")
    }
}

#[tokio::test]
async fn passphrase_clients_agree_on_the_key() {
    let store = Arc::new(MemoryStore::new());
    let (alice, bob) = (UserId::random(), UserId::random());
    let alice_client = ChatClient::new(Arc::clone(&store), alice, passphrase("hunter2"));
    let bob_client = ChatClient::new(Arc::clone(&store), bob, passphrase("hunter2"));
    let other_client = ChatClient::new(Arc::clone(&store), bob, passphrase("hunter3"));

    let from_alice = alice_client.conversation_key(bob).await.expect("key");
    let from_bob = bob_client.conversation_key(alice).await.expect("key");
    let mismatched = other_client.conversation_key(alice).await.expect("key");

    assert_eq!(from_alice.fingerprint(), from_bob.fingerprint());
    assert_ne!(from_alice.fingerprint(), mismatched.fingerprint());
}

#[tokio::test]
async fn publish_identity_is_a_no_op_for_passphrase_keys() {
    let store = Arc::new(MemoryStore::new());
    let alice = UserId::random();
    let client = ChatClient::new(Arc::clone(&store), alice, passphrase("hunter2"));

    store.fail_writes(true);
    client.publish_identity().await.expect("nothing to publish");
    assert_eq!(store.public_key(alice).await.expect("lookup"), None);
}

#[tokio::test]
async fn publish_identity_stores_the_agreement_public_key() {
    let store = Arc::new(MemoryStore::new());
    let alice = UserId::random();
    let identity = IdentityKeyPair::generate();
    let client = ChatClient::new(
        Arc::clone(&store),
        alice,
        KeySource::Agreement(identity.clone()),
    );

    client.publish_identity().await.expect("publish");
    assert_eq!(
        store.public_key(alice).await.expect("lookup"),
        Some(identity.public_key_b64())
    );

    store.fail_writes(true);
    assert!(matches!(
        client.publish_identity().await,
        Err(ChatError::Persistence(_))
    ));
}

#[tokio::test]
async fn directory_failures_map_to_persistence() {
    let store = Arc::new(BrokenDirectory {
        rows: MemoryStore::new(),
    });
    let (alice, bob) = (UserId::random(), UserId::random());
    let client = ChatClient::new(
        Arc::clone(&store),
        alice,
        KeySource::Agreement(IdentityKeyPair::generate()),
    );

    let err = client.conversation_key(bob).await.expect_err("lookup fails");
    assert!(matches!(err, ChatError::Persistence(_)));
    assert!(err.is_retryable());
    assert!(matches!(
        client.open_conversation(bob).await,
        Err(ChatError::Persistence(_))
    ));
    assert_eq!(store.rows.subscriber_count(), 0);
}

#[tokio::test]
async fn missing_peer_key_fails_before_any_subscription() {
    let store = Arc::new(MemoryStore::new());
    let (alice, bob) = (UserId::random(), UserId::random());
    let client = ChatClient::new(
        Arc::clone(&store),
        alice,
        KeySource::Agreement(IdentityKeyPair::generate()),
    );

    assert!(matches!(
        client.prepare_conversation(bob).await,
        Err(ChatError::KeyDerivation(_))
    ));
    assert_eq!(store.subscriber_count(), 0);
}

#[tokio::test]
async fn unread_count_reports_only_inbound_rows() {
    let store = Arc::new(MemoryStore::new());
    let (alice, bob) = (UserId::random(), UserId::random());
    for (sender, recipient) in [(bob, alice), (bob, alice), (alice, bob)] {
        store
            .insert(NewMessage {
                sender_id: sender,
                recipient_id: recipient,
                content: "opaque".into(),
                encrypted: true,
                attachment_url: None,
            })
            .await
            .expect("insert");
    }

    let alice_client = ChatClient::new(Arc::clone(&store), alice, passphrase("hunter2"));
    let bob_client = ChatClient::new(Arc::clone(&store), bob, passphrase("hunter2"));
    assert_eq!(alice_client.unread_count(bob).await.expect("count"), 2);
    assert_eq!(bob_client.unread_count(alice).await.expect("count"), 1);
}

#[test]
fn key_source_debug_hides_the_passphrase() {
    let rendered = format!("{:?}", passphrase("hunter2"));
    assert!(!rendered.contains("hunter2"));
}
