//! X3DH (Extended Triple Diffie-Hellman) с гибридной KEM-инкапсуляцией
//!
//! ## Ключи
//!
//! ### Alice (инициатор)
//! - **IK_A**: Identity Key (долгосрочный)
//! - **EK_A**: Ephemeral Key (одноразовый, генерируется для каждой сессии)
//!
//! ### Bob (получатель)
//! - **IK_B**: Identity Key (долгосрочный)
//! - **SPK_B**: Signed Prekey (KEM ключ, ротируется)
//! - **OPK_B**: One-Time Prekey (опционально, используется ровно один раз)
//! - **Sig(SPK_B)**: Ed25519 подпись над SPK_B
//!
//! ## Протокол
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)            // если OPK был в bundle
//! KEM = Encapsulate(SPK_B)          // гибридный, если SPK_B гибридный
//!
//! SK = HKDF-SHA256(
//!     salt = 0x00 * 32,
//!     ikm  = 0xFF * 32 || DH1 || DH2 || DH3 || DH4? || KEM_SS,
//!     info = "Construct-X3DH-v1",
//! )[..32]
//! ```
//!
//! Bob вычисляет те же DH в обратном направлении: DH(a, B) = DH(b, A).

use crate::crypto::kem::{ClassicalKeyPair, KemPublicKey, KeyEncapsulationService};
use crate::crypto::keys::{IdentityAndPrekeyStore, IdentityKeyPair};
use crate::crypto::SuiteID;
use crate::error::{CryptoError, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

pub const ROOT_SECRET_LENGTH: usize = 32;

const X3DH_INFO: &[u8] = b"Construct-X3DH-v1";
const SIGNED_PREKEY_DOMAIN: &[u8] = b"Construct-SignedPrekey-v1";

/// Публичная часть one-time prekey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekeyPublic {
    pub key_id: u32,
    pub public: [u8; 32],
}

/// Публичные ключи для инициации сессии
///
/// Alice получает этот bundle от сервера перед началом handshake с Bob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    /// Bob's Identity Public Key (IK_B_pub, X25519)
    pub identity_key: [u8; 32],

    /// Bob's Ed25519 Verifying Key для проверки подписи
    pub verifying_key: [u8; 32],

    pub signed_prekey_id: u32,

    /// Bob's Signed Prekey (SPK_B_pub), классический или гибридный
    pub signed_prekey: KemPublicKey,

    /// Sig(SPK_B)
    #[serde(with = "serde_bytes")]
    pub signed_prekey_signature: Vec<u8>,

    pub one_time_prekey: Option<OneTimePrekeyPublic>,

    pub device_id: String,

    /// Crypto suite ID
    pub suite_id: SuiteID,
}

impl PrekeyBundle {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Данные, которые Alice отправляет Bob вместе с первым сообщением
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialHandshake {
    pub initiator_identity: [u8; 32],
    pub initiator_ephemeral: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    #[serde(with = "serde_bytes")]
    pub kem_ciphertext: Vec<u8>,
}

/// Результат X3DH на стороне инициатора
pub struct AgreementOutcome {
    pub root_secret: Zeroizing<[u8; ROOT_SECRET_LENGTH]>,
    pub consumed_prekey_id: Option<u32>,
    pub kem_ciphertext: Vec<u8>,
    pub signed_prekey_id: u32,
    pub initiator_identity: [u8; 32],
    pub initiator_ephemeral: [u8; 32],
}

impl AgreementOutcome {
    /// Handshake для отправки получателю
    pub fn handshake(&self) -> InitialHandshake {
        InitialHandshake {
            initiator_identity: self.initiator_identity,
            initiator_ephemeral: self.initiator_ephemeral,
            signed_prekey_id: self.signed_prekey_id,
            one_time_prekey_id: self.consumed_prekey_id,
            kem_ciphertext: self.kem_ciphertext.clone(),
        }
    }
}

impl std::fmt::Debug for AgreementOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgreementOutcome")
            .field("root_secret", &"[REDACTED]")
            .field("consumed_prekey_id", &self.consumed_prekey_id)
            .field("signed_prekey_id", &self.signed_prekey_id)
            .field("kem_ciphertext_len", &self.kem_ciphertext.len())
            .finish()
    }
}

/// X3DH Protocol Implementation
///
/// Не хранит состояния, кроме ссылки на KEM сервис.
pub struct X3DHProtocol<'a> {
    kem: &'a KeyEncapsulationService,
}

impl<'a> X3DHProtocol<'a> {
    pub fn new(kem: &'a KeyEncapsulationService) -> Self {
        Self { kem }
    }

    /// Подписать signed prekey identity ключом
    pub fn sign_prekey(identity: &IdentityKeyPair, key_id: u32, prekey: &KemPublicKey) -> Vec<u8> {
        let message = signed_prekey_message(&identity.dh_public(), key_id, prekey);
        identity.sign(&message).to_bytes().to_vec()
    }

    /// Проверить подпись signed prekey в bundle
    pub fn verify_bundle(bundle: &PrekeyBundle) -> Result<()> {
        use tracing::debug;

        let verifying_key = VerifyingKey::from_bytes(&bundle.verifying_key)?;
        let signature = Signature::from_slice(&bundle.signed_prekey_signature)?;
        let message = signed_prekey_message(
            &bundle.identity_key,
            bundle.signed_prekey_id,
            &bundle.signed_prekey,
        );

        verifying_key.verify_strict(&message, &signature).map_err(|e| {
            debug!(target: "crypto::x3dh", device_id = %bundle.device_id, "Signature verification failed");
            CryptoError::from(e)
        })?;

        let expected_suite = bundle.signed_prekey.is_hybrid();
        if expected_suite != (bundle.suite_id == crate::crypto::PQ_HYBRID_SUITE_ID) {
            return Err(CryptoError::InvalidInputError(format!(
                "Suite {} does not match signed prekey kind",
                bundle.suite_id
            )));
        }
        Ok(())
    }

    /// Выполнить handshake как инициатор (Alice)
    ///
    /// # Ошибки
    /// - `SignatureVerificationError`: подпись SPK_B не прошла проверку
    /// - `KeyAgreementError`: вырожденный публичный ключ или несовместимый KEM
    pub fn consume_bundle(
        &self,
        bundle: &PrekeyBundle,
        initiator_identity: &IdentityKeyPair,
        initiator_ephemeral: &ClassicalKeyPair,
    ) -> Result<AgreementOutcome> {
        use tracing::{debug, trace};

        debug!(
            target: "crypto::x3dh",
            device_id = %bundle.device_id,
            suite_id = bundle.suite_id,
            "Starting X3DH as initiator"
        );

        // 1. Verify signature on signed prekey
        Self::verify_bundle(bundle)?;

        let remote_identity = PublicKey::from(bundle.identity_key);
        let remote_signed_prekey = PublicKey::from(bundle.signed_prekey.classical);

        // 2. DH операции
        let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 6));
        ikm.extend_from_slice(&[0xFFu8; 32]);

        trace!(target: "crypto::x3dh", "Computing DH1 = DH(IK_A, SPK_B)");
        ikm.extend_from_slice(&initiator_identity.dh.diffie_hellman(&remote_signed_prekey)?[..]);

        trace!(target: "crypto::x3dh", "Computing DH2 = DH(EK_A, IK_B)");
        ikm.extend_from_slice(&initiator_ephemeral.diffie_hellman(&remote_identity)?[..]);

        trace!(target: "crypto::x3dh", "Computing DH3 = DH(EK_A, SPK_B)");
        ikm.extend_from_slice(&initiator_ephemeral.diffie_hellman(&remote_signed_prekey)?[..]);

        if let Some(one_time) = &bundle.one_time_prekey {
            trace!(target: "crypto::x3dh", key_id = one_time.key_id, "Computing DH4 = DH(EK_A, OPK_B)");
            let remote_one_time = PublicKey::from(one_time.public);
            ikm.extend_from_slice(&initiator_ephemeral.diffie_hellman(&remote_one_time)?[..]);
        }

        // 3. KEM инкапсуляция к signed prekey
        let encapsulation = self.kem.encapsulate(&bundle.signed_prekey)?;
        ikm.extend_from_slice(&encapsulation.shared_secret[..]);

        // 4. Root secret
        let root_secret = derive_root_secret(&ikm)?;

        debug!(
            target: "crypto::x3dh",
            one_time_prekey = bundle.one_time_prekey.is_some(),
            hybrid = bundle.signed_prekey.is_hybrid(),
            "X3DH completed successfully as initiator"
        );

        Ok(AgreementOutcome {
            root_secret,
            consumed_prekey_id: bundle.one_time_prekey.as_ref().map(|p| p.key_id),
            kem_ciphertext: encapsulation.ciphertext,
            signed_prekey_id: bundle.signed_prekey_id,
            initiator_identity: initiator_identity.dh_public(),
            initiator_ephemeral: initiator_ephemeral.public.to_bytes(),
        })
    }

    /// Выполнить handshake как получатель (Bob)
    ///
    /// One-time prekey из handshake удаляется из `store` до вычисления секрета:
    /// повторный handshake с тем же OPK получает `PrekeyExhaustedError`.
    pub fn accept(
        &self,
        store: &mut IdentityAndPrekeyStore,
        handshake: &InitialHandshake,
    ) -> Result<Zeroizing<[u8; ROOT_SECRET_LENGTH]>> {
        use tracing::{debug, trace};

        debug!(
            target: "crypto::x3dh",
            signed_prekey_id = handshake.signed_prekey_id,
            one_time_prekey = ?handshake.one_time_prekey_id,
            "Starting X3DH as responder"
        );

        // Неизвестный signed prekey не должен сжигать one-time prekey
        store.signed_prekey(handshake.signed_prekey_id)?;

        let one_time = match handshake.one_time_prekey_id {
            Some(key_id) => Some(store.consume_one_time_prekey(key_id)?),
            None => None,
        };

        let signed_prekey = &store.signed_prekey(handshake.signed_prekey_id)?.keypair;
        let remote_identity = PublicKey::from(handshake.initiator_identity);
        let remote_ephemeral = PublicKey::from(handshake.initiator_ephemeral);

        let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 6));
        ikm.extend_from_slice(&[0xFFu8; 32]);

        trace!(target: "crypto::x3dh", "Computing DH1 = DH(SPK_B, IK_A)");
        ikm.extend_from_slice(&signed_prekey.classical().diffie_hellman(&remote_identity)?[..]);

        trace!(target: "crypto::x3dh", "Computing DH2 = DH(IK_B, EK_A)");
        ikm.extend_from_slice(&store.identity().dh.diffie_hellman(&remote_ephemeral)?[..]);

        trace!(target: "crypto::x3dh", "Computing DH3 = DH(SPK_B, EK_A)");
        ikm.extend_from_slice(&signed_prekey.classical().diffie_hellman(&remote_ephemeral)?[..]);

        if let Some(one_time) = &one_time {
            trace!(target: "crypto::x3dh", "Computing DH4 = DH(OPK_B, EK_A)");
            ikm.extend_from_slice(&one_time.diffie_hellman(&remote_ephemeral)?[..]);
        }

        let kem_secret = self.kem.decapsulate(&handshake.kem_ciphertext, signed_prekey)?;
        ikm.extend_from_slice(&kem_secret[..]);

        let root_secret = derive_root_secret(&ikm)?;

        debug!(target: "crypto::x3dh", "X3DH completed successfully as responder");
        Ok(root_secret)
    }
}

fn signed_prekey_message(identity_key: &[u8; 32], key_id: u32, prekey: &KemPublicKey) -> Vec<u8> {
    let prekey_bytes = prekey.to_bytes();
    let mut message =
        Vec::with_capacity(SIGNED_PREKEY_DOMAIN.len() + 32 + 4 + prekey_bytes.len());
    message.extend_from_slice(SIGNED_PREKEY_DOMAIN);
    message.extend_from_slice(identity_key);
    message.extend_from_slice(&key_id.to_be_bytes());
    message.extend_from_slice(&prekey_bytes);
    message
}

fn derive_root_secret(ikm: &[u8]) -> Result<Zeroizing<[u8; ROOT_SECRET_LENGTH]>> {
    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), ikm);
    let mut root = Zeroizing::new([0u8; ROOT_SECRET_LENGTH]);
    hkdf.expand(X3DH_INFO, &mut root[..])
        .map_err(|e| CryptoError::KeyAgreementError(format!("HKDF derivation failed: {}", e)))?;
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn bob_store(kem: &KeyEncapsulationService) -> IdentityAndPrekeyStore {
        IdentityAndPrekeyStore::new(kem, &Config::default())
    }

    #[test]
    fn test_x3dh_alice_bob_get_same_root_key() {
        let kem = KeyEncapsulationService::new();
        let mut bob = bob_store(&kem);
        let bob_bundle = bob.publish_bundle("bob-phone");

        let alice_identity = IdentityKeyPair::generate();
        let alice_ephemeral = ClassicalKeyPair::generate();

        let protocol = X3DHProtocol::new(&kem);
        let outcome = protocol
            .consume_bundle(&bob_bundle, &alice_identity, &alice_ephemeral)
            .unwrap();
        assert_eq!(outcome.consumed_prekey_id, None);

        let bob_root = protocol.accept(&mut bob, &outcome.handshake()).unwrap();

        assert_eq!(*outcome.root_secret, *bob_root, "X3DH must produce same root key for Alice and Bob");
    }

    #[test]
    fn test_x3dh_with_one_time_prekey() {
        let kem = KeyEncapsulationService::new();
        let mut bob = bob_store(&kem);
        bob.generate_one_time_prekeys(1);
        let bob_bundle = bob.publish_bundle("bob-phone");

        let protocol = X3DHProtocol::new(&kem);
        let outcome = protocol
            .consume_bundle(&bob_bundle, &IdentityKeyPair::generate(), &ClassicalKeyPair::generate())
            .unwrap();
        assert_eq!(outcome.consumed_prekey_id, Some(1));

        let handshake = outcome.handshake();
        let bob_root = protocol.accept(&mut bob, &handshake).unwrap();
        assert_eq!(*outcome.root_secret, *bob_root);

        // OPK удалён: повторный handshake отклоняется
        assert_eq!(
            protocol.accept(&mut bob, &handshake).unwrap_err(),
            CryptoError::PrekeyExhaustedError(1)
        );
    }

    #[test]
    fn test_x3dh_rejects_invalid_signature() {
        let kem = KeyEncapsulationService::new();
        let mut bob = bob_store(&kem);
        let mut malicious_bundle = bob.publish_bundle("bob-phone");
        malicious_bundle.signed_prekey_signature[0] ^= 0x01;

        let result = X3DHProtocol::new(&kem).consume_bundle(
            &malicious_bundle,
            &IdentityKeyPair::generate(),
            &ClassicalKeyPair::generate(),
        );
        assert!(matches!(result, Err(CryptoError::SignatureVerificationError(_))));
    }

    #[test]
    fn test_x3dh_rejects_substituted_prekey() {
        let kem = KeyEncapsulationService::new();
        let mut bob = bob_store(&kem);
        let mut bundle = bob.publish_bundle("bob-phone");
        bundle.signed_prekey = kem.generate_keypair().public_key();

        let result = X3DHProtocol::new(&kem).consume_bundle(
            &bundle,
            &IdentityKeyPair::generate(),
            &ClassicalKeyPair::generate(),
        );
        assert!(matches!(result, Err(CryptoError::SignatureVerificationError(_))));
    }

    #[test]
    fn test_unknown_signed_prekey_keeps_one_time_prekey() {
        let kem = KeyEncapsulationService::new();
        let mut bob = bob_store(&kem);
        bob.generate_one_time_prekeys(1);
        let bundle = bob.publish_bundle("bob-phone");

        let protocol = X3DHProtocol::new(&kem);
        let outcome = protocol
            .consume_bundle(&bundle, &IdentityKeyPair::generate(), &ClassicalKeyPair::generate())
            .unwrap();
        let mut handshake = outcome.handshake();
        handshake.signed_prekey_id = 42;

        assert!(matches!(
            protocol.accept(&mut bob, &handshake),
            Err(CryptoError::KeyNotFoundError(_))
        ));
        assert_eq!(bob.one_time_prekey_count(), 1);
    }

    #[test]
    fn test_accept_after_signed_prekey_rotation() {
        let kem = KeyEncapsulationService::new();
        let mut bob = bob_store(&kem);
        let bundle = bob.publish_bundle("bob-phone");

        let protocol = X3DHProtocol::new(&kem);
        let outcome = protocol
            .consume_bundle(&bundle, &IdentityKeyPair::generate(), &ClassicalKeyPair::generate())
            .unwrap();

        bob.rotate_signed_prekey(&kem);
        let bob_root = protocol.accept(&mut bob, &outcome.handshake()).unwrap();
        assert_eq!(*outcome.root_secret, *bob_root);
    }

    #[test]
    fn test_bundle_json_roundtrip() {
        let kem = KeyEncapsulationService::new();
        let mut bob = bob_store(&kem);
        bob.generate_one_time_prekeys(1);
        let bundle = bob.publish_bundle("bob-phone");

        let json = bundle.to_json().unwrap();
        let decoded = PrekeyBundle::from_json(&json).unwrap();
        assert_eq!(decoded, bundle);
        assert!(X3DHProtocol::verify_bundle(&decoded).is_ok());
        assert!(PrekeyBundle::from_json("{not json").is_err());
    }
}
