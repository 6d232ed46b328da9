use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{Deserialize, Serialize};
use shared::error::ChatError;

use crate::keys::ConversationKey;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Printable sealed body: base64 of `nonce || ciphertext || tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(String);

impl Envelope {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seals `plaintext` under a nonce drawn from the OS RNG on every call.
pub fn seal(key: &ConversationKey, plaintext: &[u8]) -> Result<Envelope, ChatError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| ChatError::Encryption("AEAD encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(Envelope(STANDARD.encode(out)))
}

/// Opens an envelope. Fails on malformed input, tag mismatch or wrong key.
pub fn open(key: &ConversationKey, envelope: &str) -> Result<Vec<u8>, ChatError> {
    let data = STANDARD
        .decode(envelope.trim())
        .map_err(|_| ChatError::Decryption("envelope is not valid base64".into()))?;
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(ChatError::Decryption(format!(
            "envelope too short: {} bytes",
            data.len()
        )));
    }

    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            ChatError::Decryption("authentication tag mismatch (wrong key or corrupted envelope)".into())
        })
}

pub fn open_text(key: &ConversationKey, envelope: &str) -> Result<String, ChatError> {
    String::from_utf8(open(key, envelope)?)
        .map_err(|_| ChatError::Decryption("plaintext is not valid UTF-8".into()))
}
