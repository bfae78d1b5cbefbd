//! Integration tests for the E2EE core
//!
//! This test suite covers:
//! - Hybrid KEM (X25519 [+ Kyber768])
//! - AES-256-GCM envelope
//! - X3DH Key Agreement
//! - Double Ratchet Protocol
//! - Sessions via CryptoContext
//! - Key vault and group sender keys

use construct_e2ee::crypto::cipher::{Envelope, SymmetricCipher};
use construct_e2ee::crypto::handshake::X3DHProtocol;
use construct_e2ee::crypto::kem::KeyEncapsulationService;
use construct_e2ee::crypto::keys::IdentityAndPrekeyStore;
use construct_e2ee::crypto::messaging::{Direction, DoubleRatchetEngine, Role};
use construct_e2ee::crypto::sender_keys::GroupSenderKeyManager;
use construct_e2ee::crypto::vault::{KeyType, SecureKeyVault};
use construct_e2ee::storage::BundleDirectory;
use construct_e2ee::{Config, CryptoContext, CryptoError};

fn root_secret() -> Vec<u8> {
    hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f").unwrap()
}

/// Alice и Bob получают одинаковый shared secret через KEM
#[test]
fn test_kem_alice_bob() {
    let kem = KeyEncapsulationService::new();
    let bob = kem.generate_keypair();

    let encapsulation = kem.encapsulate(&bob.public_key()).unwrap();
    let shared = kem.decapsulate(&encapsulation.ciphertext, &bob).unwrap();

    assert_eq!(shared[..], encapsulation.shared_secret[..]);
}

/// Независимые пары ключей дают разные секреты
#[test]
fn test_kem_independent_keypairs() {
    let kem = KeyEncapsulationService::new();
    let first = kem.generate_keypair();
    let second = kem.generate_keypair();

    let a = kem.encapsulate(&first.public_key()).unwrap();
    let b = kem.encapsulate(&second.public_key()).unwrap();
    assert_ne!(a.shared_secret[..], b.shared_secret[..]);
    assert_ne!(first.public_key(), second.public_key());
}

#[test]
fn test_cipher_roundtrip_and_tamper() {
    let cipher = SymmetricCipher::default();
    let key = [7u8; 32];
    let aad = b"header";

    let envelope = cipher.encrypt(b"Hello, Construct!", &key, aad).unwrap();
    let bytes = envelope.to_bytes();
    assert_eq!(
        cipher.decrypt_bytes(&bytes, &key, aad).unwrap().as_slice(),
        b"Hello, Construct!"
    );

    for index in [0, 12, bytes.len() - 1] {
        let mut tampered = bytes.clone();
        tampered[index] ^= 0x80;
        assert_eq!(
            cipher.decrypt_bytes(&tampered, &key, aad).unwrap_err(),
            CryptoError::AuthenticationError
        );
    }

    let wrong_key = [8u8; 32];
    assert_eq!(
        cipher
            .decrypt(&Envelope::from_bytes(&bytes).unwrap(), &wrong_key, aad)
            .unwrap_err(),
        CryptoError::AuthenticationError
    );
}

#[test]
fn test_cipher_payload_limit() {
    let config = Config {
        max_plaintext_len: 16,
        ..Config::default()
    };
    let cipher = SymmetricCipher::new(&config);
    assert!(matches!(
        cipher.encrypt(&[0u8; 17], &[1u8; 32], b""),
        Err(CryptoError::PayloadTooLarge { size: 17, limit: 16 })
    ));
}

/// Пять ключей отправки подряд: счётчик = 5, ключи различны
#[test]
fn test_five_send_keys() {
    let mut engine = DoubleRatchetEngine::new(&Config::default());
    engine.initialize(&root_secret(), Role::Initiator).unwrap();

    let keys: Vec<[u8; 32]> = (0..5)
        .map(|_| *engine.derive_message_key(Direction::Send).unwrap())
        .collect();

    assert_eq!(engine.counter(Direction::Send), 5);
    for (i, a) in keys.iter().enumerate() {
        for b in &keys[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

/// Send chain инициатора совпадает с recv chain получателя
#[test]
fn test_mirrored_engines() {
    let config = Config::default();
    let mut alice = DoubleRatchetEngine::new(&config);
    let mut bob = DoubleRatchetEngine::new(&config);
    alice.initialize(&root_secret(), Role::Initiator).unwrap();
    bob.initialize(&root_secret(), Role::Responder).unwrap();

    for _ in 0..3 {
        let sent = alice.derive_message_key(Direction::Send).unwrap();
        let received = bob.derive_message_key(Direction::Recv).unwrap();
        assert_eq!(sent[..], received[..]);
    }
}

#[test]
fn test_dh_ratchet_resets_counters() {
    let config = Config::default();
    let mut alice = DoubleRatchetEngine::new(&config);
    alice.initialize(&root_secret(), Role::Initiator).unwrap();
    for _ in 0..3 {
        alice.derive_message_key(Direction::Send).unwrap();
    }

    let root_before = alice.to_state().unwrap().root_key;
    let peer = KeyEncapsulationService::new().generate_keypair();
    let new_public = alice
        .perform_dh_ratchet(&peer.classical().public.to_bytes())
        .unwrap();

    let state = alice.to_state().unwrap();
    assert_ne!(state.root_key, root_before);
    assert_eq!(alice.counter(Direction::Send), 0);
    assert_eq!(alice.counter(Direction::Recv), 0);
    assert_eq!(alice.previous_chain_lengths().send, 3);
    assert_eq!(alice.generation(), 1);
    assert_eq!(alice.local_ratchet_public().unwrap(), new_public);
}

/// Подмена подписи signed prekey отклоняется
#[test]
fn test_x3dh_tampered_signature() {
    let config = Config::default();
    let kem = KeyEncapsulationService::new();
    let mut bob = IdentityAndPrekeyStore::new(&kem, &config);

    let mut bundle = bob.publish_bundle("phone");
    bundle.signed_prekey_signature[0] ^= 0x01;

    assert!(matches!(
        X3DHProtocol::verify_bundle(&bundle),
        Err(CryptoError::SignatureVerificationError(_))
    ));
}

/// Полный диалог через контекст: доставка не по порядку через границу ratchet
#[test]
fn test_session_out_of_order_across_ratchet() {
    let alice = CryptoContext::default();
    let bob = CryptoContext::default();
    bob.generate_one_time_prekeys(5).unwrap();

    let mut directory = BundleDirectory::new();
    directory.publish("bob", bob.publish_bundle("phone").unwrap());
    let bundle = directory.fetch_bundle("bob", "phone").unwrap();

    let (alice_sid, handshake) = alice.init_session("alice", "bob", &bundle).unwrap();
    let bob_sid = bob.accept_session("bob", "alice", &handshake).unwrap();

    let a1 = alice.encrypt(&alice_sid, b"a1").unwrap();
    let a2 = alice.encrypt(&alice_sid, b"a2").unwrap();
    assert_eq!(bob.decrypt(&bob_sid, &a1).unwrap().as_slice(), b"a1");

    let b1 = bob.encrypt(&bob_sid, b"b1").unwrap();
    assert_eq!(alice.decrypt(&alice_sid, &b1).unwrap().as_slice(), b"b1");

    // a3 уже под новым ratchet key, a2 приходит после него
    let a3 = alice.encrypt(&alice_sid, b"a3").unwrap();
    assert_ne!(a3.header.ratchet_public, a2.header.ratchet_public);
    assert_eq!(a3.header.previous_chain_length, 2);

    assert_eq!(bob.decrypt(&bob_sid, &a3).unwrap().as_slice(), b"a3");
    assert_eq!(bob.decrypt(&bob_sid, &a2).unwrap().as_slice(), b"a2");

    // Повтор уже расшифрованного сообщения
    assert!(matches!(
        bob.decrypt(&bob_sid, &a2),
        Err(CryptoError::KeyNotFoundError(_))
    ));

    // Wire-формат сообщения
    let wire = a3.to_bytes().unwrap();
    let parsed = construct_e2ee::crypto::RatchetMessage::from_bytes(&wire).unwrap();
    assert_eq!(parsed, a3);
}

#[test]
fn test_too_many_skipped_messages() {
    let config = Config {
        max_skipped_messages: 3,
        ..Config::default()
    };
    let alice = CryptoContext::new(config.clone());
    let bob = CryptoContext::new(config);

    let bundle = bob.publish_bundle("phone").unwrap();
    let (alice_sid, handshake) = alice.init_session("alice", "bob", &bundle).unwrap();
    let bob_sid = bob.accept_session("bob", "alice", &handshake).unwrap();

    let mut last = None;
    for i in 0..5 {
        last = Some(alice.encrypt(&alice_sid, format!("m{}", i).as_bytes()).unwrap());
    }

    assert_eq!(
        bob.decrypt(&bob_sid, &last.unwrap()).unwrap_err(),
        CryptoError::TooManySkippedMessages { requested: 4, limit: 3 }
    );
}

/// One-time prekey используется ровно один раз
#[test]
fn test_one_time_prekey_exhaustion() {
    let alice = CryptoContext::default();
    let carol = CryptoContext::default();
    let bob = CryptoContext::default();
    bob.generate_one_time_prekeys(1).unwrap();

    let bundle = bob.publish_bundle("phone").unwrap();
    let (_, from_alice) = alice.init_session("alice", "bob", &bundle).unwrap();
    let (_, from_carol) = carol.init_session("carol", "bob", &bundle).unwrap();
    let key_id = from_alice.one_time_prekey_id.unwrap();

    bob.accept_session("bob", "alice", &from_alice).unwrap();
    assert_eq!(
        bob.accept_session("bob", "carol", &from_carol).unwrap_err(),
        CryptoError::PrekeyExhaustedError(key_id)
    );
}

#[test]
fn test_vault_generate_get_delete() {
    let vault = SecureKeyVault::new(&Config::default());

    let key_id = vault.generate_key("identity", KeyType::X25519).unwrap();
    assert_eq!(key_id, "identity");
    assert_eq!(vault.get_key(&key_id).unwrap().len(), 32);
    assert!(vault.public_key(&key_id).unwrap().is_some());

    vault.delete_key(&key_id).unwrap();
    assert!(matches!(
        vault.get_key(&key_id),
        Err(CryptoError::KeyNotFoundError(_))
    ));
}

#[test]
fn test_vault_foreign_entry_is_fatal() {
    let config = Config::default();
    let first = SecureKeyVault::new(&config);
    let second = SecureKeyVault::new(&config);

    let key_id = first.generate_key("", KeyType::Symmetric).unwrap();
    second.import_entry(first.export_entry(&key_id).unwrap()).unwrap();

    let err = second.get_key(&key_id).unwrap_err();
    assert!(matches!(err, CryptoError::VaultMasterKeyError(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_group_missing_recipients() {
    let manager = GroupSenderKeyManager::new();
    let members = ["alice", "bob", "carol"];

    manager.rotate_sender_key("team", "alice").unwrap();
    assert_eq!(
        manager.get_missing_recipients("team", "alice", members).unwrap().len(),
        2
    );

    manager.store_sender_key("team", "alice", "bob", vec![1, 2, 3], 1).unwrap();
    manager.store_sender_key("team", "alice", "carol", vec![4, 5, 6], 1).unwrap();
    assert!(manager
        .get_missing_recipients("team", "alice", members)
        .unwrap()
        .is_empty());
}
