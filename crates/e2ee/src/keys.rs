use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use shared::{
    domain::{ConversationPair, UserId},
    error::ChatError,
};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;

const PASSPHRASE_PAD: u8 = b'0';
const PASSPHRASE_SALT: &[u8] = b"dm-engine/passphrase-key/v1";
/// Deterministic application salt for X25519 agreement output.
const AGREEMENT_SALT: &[u8] = b"dm-engine/x25519-agreement/v1";
const KEY_INFO_PREFIX: &[u8] = b"dm-engine/conversation-key/v1";

/// Symmetric AEAD key shared by exactly two participants.
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; KEY_LEN]);

impl ConversationKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short digest of the key, safe to log or compare out of band.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.0)
            .iter()
            .take(8)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

impl Drop for ConversationKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Long-lived X25519 identity whose public half is published for peers.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_b64(raw: &str) -> Result<Self, ChatError> {
        let bytes = Zeroizing::new(decode_key_bytes(raw, "identity secret")?);
        Ok(Self::from_secret(StaticSecret::from(*bytes)))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    pub fn secret_b64(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(self.secret.to_bytes());
        Zeroizing::new(STANDARD.encode(bytes.as_slice()))
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

/// Input to [`derive_key`], selected by configuration.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Secret string known to both participants out of band.
    Passphrase(Zeroizing<String>),
    /// Local identity plus the peer's published public key.
    Agreement {
        local: IdentityKeyPair,
        remote_public_b64: String,
    },
}

impl KeyMaterial {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self::Passphrase(Zeroizing::new(passphrase.into()))
    }

    pub fn agreement(local: IdentityKeyPair, remote_public_b64: impl Into<String>) -> Self {
        Self::Agreement {
            local,
            remote_public_b64: remote_public_b64.into(),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("KeyMaterial::Passphrase(<redacted>)"),
            Self::Agreement {
                local,
                remote_public_b64,
            } => f
                .debug_struct("KeyMaterial::Agreement")
                .field("local", local)
                .field("remote_public_b64", remote_public_b64)
                .finish(),
        }
    }
}

/// Derives the conversation key for `{local, remote}`.
///
/// Deterministic in its inputs: the counterparty calling this with the
/// roles swapped (and its own half of the material) gets a bit-identical key.
pub fn derive_key(
    local: UserId,
    remote: UserId,
    material: &KeyMaterial,
) -> Result<ConversationKey, ChatError> {
    if local == remote {
        return Err(ChatError::KeyDerivation(
            "a conversation needs two distinct participants".into(),
        ));
    }

    let key = match material {
        KeyMaterial::Passphrase(passphrase) => passphrase_key(passphrase)?,
        KeyMaterial::Agreement {
            local: identity,
            remote_public_b64,
        } => agreement_key(
            ConversationPair::new(local, remote),
            identity,
            remote_public_b64,
        )?,
    };
    debug!(
        %local,
        %remote,
        fingerprint = %key.fingerprint(),
        "e2ee: conversation key derived"
    );
    Ok(key)
}

fn passphrase_key(passphrase: &str) -> Result<ConversationKey, ChatError> {
    if passphrase.is_empty() {
        return Err(ChatError::KeyDerivation("passphrase must not be empty".into()));
    }

    let mut padded = Zeroizing::new([PASSPHRASE_PAD; KEY_LEN]);
    let bytes = passphrase.as_bytes();
    let len = bytes.len().min(KEY_LEN);
    padded[..len].copy_from_slice(&bytes[..len]);
    expand(PASSPHRASE_SALT, padded.as_slice(), KEY_INFO_PREFIX)
}

fn agreement_key(
    pair: ConversationPair,
    identity: &IdentityKeyPair,
    remote_public_b64: &str,
) -> Result<ConversationKey, ChatError> {
    let remote = PublicKey::from(decode_key_bytes(remote_public_b64, "remote public key")?);
    let shared = identity.secret.diffie_hellman(&remote);
    if !shared.was_contributory() {
        return Err(ChatError::KeyDerivation(
            "remote public key is a low-order point".into(),
        ));
    }

    let (low, high) = pair.participants();
    let mut info = Vec::with_capacity(KEY_INFO_PREFIX.len() + 32);
    info.extend_from_slice(KEY_INFO_PREFIX);
    info.extend_from_slice(low.0.as_bytes());
    info.extend_from_slice(high.0.as_bytes());
    expand(AGREEMENT_SALT, shared.as_bytes(), &info)
}

fn expand(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<ConversationKey, ChatError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, okm.as_mut_slice())
        .map_err(|err| ChatError::KeyDerivation(err.to_string()))?;
    Ok(ConversationKey(*okm))
}

fn decode_key_bytes(raw: &str, what: &str) -> Result<[u8; KEY_LEN], ChatError> {
    let decoded = Zeroizing::new(
        STANDARD
            .decode(raw.trim())
            .map_err(|err| ChatError::KeyDerivation(format!("{what} is not valid base64: {err}")))?,
    );
    <[u8; KEY_LEN]>::try_from(decoded.as_slice()).map_err(|_| {
        ChatError::KeyDerivation(format!(
            "{what} must be {KEY_LEN} bytes, got {}",
            decoded.len()
        ))
    })
}
