use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident, $inner:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(UserId, Uuid);
id_newtype!(MessageId, i64);

impl UserId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(raw.trim()).map(Self)
    }
}

/// Unordered pair of participants identifying one direct conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationPair {
    low: UserId,
    high: UserId,
}

impl ConversationPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Participants in canonical (sorted) order.
    pub fn participants(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    /// Membership filter: true iff `{sender, recipient}` is exactly this pair.
    pub fn matches(&self, sender: UserId, recipient: UserId) -> bool {
        Self::new(sender, recipient) == *self
    }
}
