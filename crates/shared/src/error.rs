use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("cannot establish secure channel: {0}")]
    KeyDerivation(String),
    #[error("message could not be sealed: {0}")]
    Encryption(String),
    #[error("message could not be decrypted: {0}")]
    Decryption(String),
    #[error("failed to persist message state: {0}")]
    Persistence(String),
    #[error("live message feed dropped: {0}")]
    Subscription(String),
    #[error("conversation is closed")]
    ConversationClosed,
}

impl ChatError {
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Retrying the same operation may succeed without user intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Subscription(_))
    }
}
