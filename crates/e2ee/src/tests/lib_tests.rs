use super::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{domain::UserId, error::ChatError};

fn passphrase_key(secret: &str) -> ConversationKey {
    derive_key(
        UserId::random(),
        UserId::random(),
        &KeyMaterial::passphrase(secret),
    )
    .expect("derive")
}

#[test]
fn sealed_envelope_opens_to_original_plaintext() {
    let key = passphrase_key("hunter2");
    for plaintext in ["hello", "", "ünïcødé ✓", "a much longer message body \n with lines"] {
        let envelope = seal(&key, plaintext.as_bytes()).expect("seal");
        assert_eq!(open_text(&key, envelope.as_str()).expect("open"), plaintext);
    }
}

#[test]
fn opening_with_another_key_fails() {
    let sealed_with = passphrase_key("hunter2");
    let other = passphrase_key("hunter3");
    let envelope = seal(&sealed_with, b"hello").expect("seal");

    let err = open(&other, envelope.as_str()).expect_err("must not decrypt");
    assert!(matches!(err, ChatError::Decryption(_)));
}

#[test]
fn sealing_twice_uses_fresh_nonces() {
    let key = passphrase_key("hunter2");
    let first = seal(&key, b"same text").expect("seal");
    let second = seal(&key, b"same text").expect("seal");
    assert_ne!(first, second);

    let first_raw = STANDARD.decode(first.as_str()).expect("b64");
    let second_raw = STANDARD.decode(second.as_str()).expect("b64");
    assert_ne!(first_raw[..NONCE_LEN], second_raw[..NONCE_LEN]);

    assert_eq!(open(&key, first.as_str()).expect("open"), b"same text");
    assert_eq!(open(&key, second.as_str()).expect("open"), b"same text");
}

#[test]
fn envelope_layout_is_nonce_ciphertext_tag() {
    let key = passphrase_key("hunter2");
    let envelope = seal(&key, b"hello").expect("seal");
    let raw = STANDARD.decode(envelope.as_str()).expect("b64");
    assert_eq!(raw.len(), NONCE_LEN + 5 + TAG_LEN);
    assert!(!envelope.as_str().contains("hello"));
}

#[test]
fn tampered_or_truncated_envelopes_are_rejected() {
    let key = passphrase_key("hunter2");
    let envelope = seal(&key, b"hello").expect("seal");

    let mut raw = STANDARD.decode(envelope.as_str()).expect("b64");
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    let tampered = STANDARD.encode(&raw);
    assert!(matches!(open(&key, &tampered), Err(ChatError::Decryption(_))));

    let truncated = STANDARD.encode(&raw[..NONCE_LEN + TAG_LEN - 1]);
    assert!(matches!(open(&key, &truncated), Err(ChatError::Decryption(_))));

    assert!(matches!(open(&key, "hello"), Err(ChatError::Decryption(_))));
    assert!(matches!(open(&key, "not base64!!"), Err(ChatError::Decryption(_))));
}

#[test]
fn open_is_repeatable() {
    let key = passphrase_key("hunter2");
    let envelope = seal(&key, b"again").expect("seal");
    for _ in 0..3 {
        assert_eq!(open(&key, envelope.as_str()).expect("open"), b"again");
    }
}

#[test]
fn passphrase_key_is_deterministic_and_direction_free() {
    let a = UserId::random();
    let b = UserId::random();
    let material = KeyMaterial::passphrase("hunter2");

    let from_a = derive_key(a, b, &material).expect("a");
    let from_b = derive_key(b, a, &material).expect("b");
    assert_eq!(from_a, from_b);
    assert_eq!(from_a.fingerprint(), from_b.fingerprint());
}

#[test]
fn passphrase_longer_than_key_is_truncated() {
    let base = "x".repeat(KEY_LEN);
    let longer = format!("{base}-ignored-suffix");
    assert_eq!(passphrase_key(&base), passphrase_key(&longer));
}

#[test]
fn passphrase_padding_uses_ascii_zero() {
    // Short passphrases are right-padded with '0', so a trailing '0' is not significant.
    assert_eq!(passphrase_key("hunter2"), passphrase_key("hunter20"));
    assert_ne!(passphrase_key("hunter2"), passphrase_key("hunter3"));
}

#[test]
fn empty_passphrase_is_rejected() {
    let err = derive_key(UserId::random(), UserId::random(), &KeyMaterial::passphrase(""))
        .expect_err("empty passphrase");
    assert!(matches!(err, ChatError::KeyDerivation(_)));
}

#[test]
fn same_participant_on_both_sides_is_rejected() {
    let a = UserId::random();
    let err = derive_key(a, a, &KeyMaterial::passphrase("hunter2")).expect_err("self");
    assert!(matches!(err, ChatError::KeyDerivation(_)));
}

#[test]
fn key_agreement_yields_identical_keys_on_both_sides() {
    let alice = UserId::random();
    let bob = UserId::random();
    let alice_keys = IdentityKeyPair::generate();
    let bob_keys = IdentityKeyPair::generate();

    let alice_view = derive_key(
        alice,
        bob,
        &KeyMaterial::agreement(alice_keys.clone(), bob_keys.public_key_b64()),
    )
    .expect("alice derive");
    let bob_view = derive_key(
        bob,
        alice,
        &KeyMaterial::agreement(bob_keys.clone(), alice_keys.public_key_b64()),
    )
    .expect("bob derive");
    assert_eq!(alice_view, bob_view);

    let again = derive_key(
        alice,
        bob,
        &KeyMaterial::agreement(alice_keys, bob_keys.public_key_b64()),
    )
    .expect("repeat");
    assert_eq!(alice_view, again);
}

#[test]
fn key_agreement_binds_the_participant_pair() {
    let alice = UserId::random();
    let bob = UserId::random();
    let carol = UserId::random();
    let alice_keys = IdentityKeyPair::generate();
    let peer_keys = IdentityKeyPair::generate();
    let material = KeyMaterial::agreement(alice_keys, peer_keys.public_key_b64());

    let with_bob = derive_key(alice, bob, &material).expect("bob");
    let with_carol = derive_key(alice, carol, &material).expect("carol");
    assert_ne!(with_bob, with_carol);
}

#[test]
fn malformed_public_keys_fail_derivation() {
    let local = IdentityKeyPair::generate();
    let a = UserId::random();
    let b = UserId::random();

    for bad in [
        "%%%".to_string(),
        STANDARD.encode([7u8; 31]),
        STANDARD.encode([0u8; 32]),
    ] {
        let err = derive_key(a, b, &KeyMaterial::agreement(local.clone(), bad))
            .expect_err("malformed key");
        assert!(matches!(err, ChatError::KeyDerivation(_)));
    }
}

#[test]
fn identity_secret_round_trips_through_base64() {
    let original = IdentityKeyPair::generate();
    let restored = IdentityKeyPair::from_secret_b64(&original.secret_b64()).expect("restore");
    assert_eq!(original.public_key_b64(), restored.public_key_b64());
}

#[test]
fn debug_output_never_contains_key_bytes() {
    let key = passphrase_key("hunter2");
    let rendered = format!("{key:?}");
    assert!(rendered.contains(&key.fingerprint()));
    assert!(!rendered.contains("hunter2"));

    let material = KeyMaterial::passphrase("hunter2");
    assert!(!format!("{material:?}").contains("hunter2"));
}
