//! Conversation key material and the sealed message envelope.
//!
//! Both participants derive the same [`ConversationKey`] independently from
//! [`KeyMaterial`]; the key never leaves process memory. Message bodies are
//! sealed into printable [`Envelope`] text before they reach the store.

mod envelope;
mod keys;

pub use envelope::{open, open_text, seal, Envelope, NONCE_LEN, TAG_LEN};
pub use keys::{derive_key, ConversationKey, IdentityKeyPair, KeyMaterial, KEY_LEN};

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
