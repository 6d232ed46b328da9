//! Client side of the direct-message engine.
//!
//! [`ChatClient`] resolves the conversation key for a peer and opens a
//! [`Conversation`], which merges the stored history with the live insert
//! feed and seals outgoing text before it reaches the store.

use std::{fmt, sync::Arc};

use e2ee::{derive_key, ConversationKey, IdentityKeyPair, KeyMaterial};
use shared::{domain::UserId, error::ChatError};
use storage::{ConversationStore, KeyDirectory};
use tracing::{error, info};
use zeroize::Zeroizing;

pub mod config;
mod conversation;
pub mod read_state;
pub mod send;
pub mod transcript;

pub use conversation::{Conversation, ConversationEvent, Draft};
pub use transcript::{ConversationState, Transcript, TranscriptEntry, UNREADABLE_PLACEHOLDER};

/// Where the local user's half of the key material comes from.
#[derive(Clone)]
pub enum KeySource {
    Passphrase(Zeroizing<String>),
    /// Local identity; the peer's public key is looked up in the directory.
    Agreement(IdentityKeyPair),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("KeySource::Passphrase(<redacted>)"),
            Self::Agreement(identity) => f
                .debug_tuple("KeySource::Agreement")
                .field(identity)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationOptions {
    /// Shown in place of a message that cannot be opened.
    pub unreadable_placeholder: String,
    pub event_capacity: usize,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            unreadable_placeholder: UNREADABLE_PLACEHOLDER.into(),
            event_capacity: storage::DEFAULT_FEED_CAPACITY,
        }
    }
}

pub struct ChatClient {
    local: UserId,
    keys: KeySource,
    store: Arc<dyn ConversationStore>,
    directory: Arc<dyn KeyDirectory>,
    options: ConversationOptions,
}

impl ChatClient {
    pub fn new<S>(store: Arc<S>, local: UserId, keys: KeySource) -> Self
    where
        S: ConversationStore + KeyDirectory + 'static,
    {
        Self {
            local,
            keys,
            store: store.clone(),
            directory: store,
            options: ConversationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConversationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn local_user(&self) -> UserId {
        self.local
    }

    /// Publishes the local public key so peers can agree on a key with us.
    /// A no-op for passphrase keys.
    pub async fn publish_identity(&self) -> Result<(), ChatError> {
        let KeySource::Agreement(identity) = &self.keys else {
            return Ok(());
        };
        self.directory
            .publish_public_key(self.local, &identity.public_key_b64())
            .await
            .map_err(|err| ChatError::persistence(format!("{err:#}")))?;
        info!(user = %self.local, "keys: public key published");
        Ok(())
    }

    pub async fn conversation_key(&self, peer: UserId) -> Result<ConversationKey, ChatError> {
        let material = match &self.keys {
            KeySource::Passphrase(passphrase) => KeyMaterial::Passphrase(passphrase.clone()),
            KeySource::Agreement(identity) => {
                let remote = self
                    .directory
                    .public_key(peer)
                    .await
                    .map_err(|err| ChatError::persistence(format!("{err:#}")))?
                    .ok_or_else(|| {
                        ChatError::KeyDerivation(format!("{peer} has not published a public key"))
                    })?;
                KeyMaterial::agreement(identity.clone(), remote)
            }
        };
        derive_key(self.local, peer, &material)
    }

    /// Derives the key and returns the conversation in `Empty` state, so a
    /// caller can subscribe to its events before [`Conversation::load`].
    ///
    /// A key failure is returned before anything is queried; a conversation
    /// never exists without a key.
    pub async fn prepare_conversation(&self, peer: UserId) -> Result<Conversation, ChatError> {
        let key = self.conversation_key(peer).await.map_err(|err| {
            error!(local = %self.local, %peer, error = %err, "keys: cannot open conversation");
            err
        })?;
        Ok(Conversation::new(
            Arc::clone(&self.store),
            self.local,
            peer,
            key,
            &self.options,
        ))
    }

    /// [`ChatClient::prepare_conversation`] followed by [`Conversation::load`].
    pub async fn open_conversation(&self, peer: UserId) -> Result<Conversation, ChatError> {
        let mut conversation = self.prepare_conversation(peer).await?;
        conversation.load().await?;
        Ok(conversation)
    }

    pub async fn unread_count(&self, peer: UserId) -> Result<u64, ChatError> {
        self.store
            .unread_count(self.local, peer)
            .await
            .map_err(|err| ChatError::persistence(format!("{err:#}")))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
