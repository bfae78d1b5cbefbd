//! Hybrid Key Encapsulation (X25519 + Kyber-768)
//!
//! Классическая часть (X25519) присутствует всегда. Пост-квантовая часть
//! (Kyber-768) доступна только при сборке с feature `post-quantum`.
//! Если PQ-примитив не слинкован, `generate_keypair` возвращает явный вариант
//! [`HybridKeyPair::Classical`]: пониженный уровень защиты виден вызывающему коду
//! через тег, а не скрыт.
//!
//! ## Формат ciphertext
//!
//! ```text
//! ┌──────────────────────────────┬─────────────────────────────┐
//! │ ephemeral X25519 public (32) │ Kyber-768 ciphertext (opt.) │
//! └──────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! ## Shared secret
//!
//! ```text
//! SS = HKDF-SHA256(
//!     salt = ephemeral_pub || recipient_classical_pub,
//!     ikm  = ECDH || PQ_SS?,
//!     info = "Construct-Hybrid-KEM-v1",
//! )[..32]
//! ```

use crate::crypto::{SuiteID, CLASSIC_SUITE_ID, PQ_HYBRID_SUITE_ID};
use crate::error::{CryptoError, Result};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const CLASSICAL_KEY_LENGTH: usize = 32;
pub const SHARED_SECRET_LENGTH: usize = 32;

const KEM_INFO: &[u8] = b"Construct-Hybrid-KEM-v1";

/// Классическая пара ключей X25519
#[derive(Clone)]
pub struct ClassicalKeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl ClassicalKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// X25519 DH, отклоняющий вырожденный (all-zero) результат
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; 32]>> {
        let shared = self.secret.diffie_hellman(peer);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreementError(
                "Non-contributory X25519 public key".to_string(),
            ));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for ClassicalKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassicalKeyPair")
            .field("public", &self.public.as_bytes())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Пост-квантовая пара ключей (Kyber-768), хранится как сырые байты
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PqKeyPair {
    #[zeroize(skip)]
    pub public: Vec<u8>,
    secret: Vec<u8>,
}

impl PqKeyPair {
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}

impl std::fmt::Debug for PqKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PqKeyPair")
            .field("public_len", &self.public.len())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Пара ключей KEM: классическая или гибридная
#[derive(Debug, Clone)]
pub enum HybridKeyPair {
    Classical(ClassicalKeyPair),
    Hybrid {
        classical: ClassicalKeyPair,
        pq: PqKeyPair,
    },
}

impl HybridKeyPair {
    pub fn classical(&self) -> &ClassicalKeyPair {
        match self {
            HybridKeyPair::Classical(classical) => classical,
            HybridKeyPair::Hybrid { classical, .. } => classical,
        }
    }

    pub fn pq(&self) -> Option<&PqKeyPair> {
        match self {
            HybridKeyPair::Classical(_) => None,
            HybridKeyPair::Hybrid { pq, .. } => Some(pq),
        }
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self, HybridKeyPair::Hybrid { .. })
    }

    pub fn suite_id(&self) -> SuiteID {
        if self.is_hybrid() {
            PQ_HYBRID_SUITE_ID
        } else {
            CLASSIC_SUITE_ID
        }
    }

    pub fn public_key(&self) -> KemPublicKey {
        KemPublicKey {
            classical: self.classical().public.to_bytes(),
            pq: self.pq().map(|pq| pq.public.clone()),
        }
    }
}

/// Публичная часть KEM ключа
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemPublicKey {
    pub classical: [u8; 32],
    #[serde(default)]
    pub pq: Option<Vec<u8>>,
}

impl KemPublicKey {
    pub fn is_hybrid(&self) -> bool {
        self.pq.is_some()
    }

    /// Каноническое кодирование (подписывается в prekey bundle):
    /// `classical (32) || pq`
    pub fn to_bytes(&self) -> Vec<u8> {
        let pq_len = self.pq.as_ref().map_or(0, |pq| pq.len());
        let mut out = Vec::with_capacity(CLASSICAL_KEY_LENGTH + pq_len);
        out.extend_from_slice(&self.classical);
        if let Some(pq) = &self.pq {
            out.extend_from_slice(pq);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CLASSICAL_KEY_LENGTH {
            return Err(CryptoError::invalid_length(CLASSICAL_KEY_LENGTH, bytes.len()));
        }
        let mut classical = [0u8; 32];
        classical.copy_from_slice(&bytes[..CLASSICAL_KEY_LENGTH]);
        let rest = &bytes[CLASSICAL_KEY_LENGTH..];
        Ok(Self {
            classical,
            pq: if rest.is_empty() { None } else { Some(rest.to_vec()) },
        })
    }
}

/// Результат инкапсуляции
pub struct Encapsulation {
    pub ciphertext: Vec<u8>,
    pub shared_secret: Zeroizing<[u8; SHARED_SECRET_LENGTH]>,
}

/// Сервис гибридной инкапсуляции ключей
#[derive(Debug, Default)]
pub struct KeyEncapsulationService {
    degradation_reported: AtomicBool,
}

impl KeyEncapsulationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Слинкован ли PQ-примитив (независимо от конкретной пары ключей)
    pub fn is_quantum_resistant(&self) -> bool {
        pq::AVAILABLE
    }

    /// Сгенерировать пару ключей; гибридную, если PQ доступен
    pub fn generate_keypair(&self) -> HybridKeyPair {
        let classical = ClassicalKeyPair::generate();
        match pq::generate() {
            Some(pq) => HybridKeyPair::Hybrid { classical, pq },
            None => {
                if !self.degradation_reported.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        target: "crypto::kem",
                        "Post-quantum KEM unavailable, generating classical-only keypairs"
                    );
                }
                HybridKeyPair::Classical(classical)
            }
        }
    }

    /// Инкапсулировать shared secret для публичного ключа собеседника
    pub fn encapsulate(&self, peer: &KemPublicKey) -> Result<Encapsulation> {
        use tracing::trace;

        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);
        let peer_classical = PublicKey::from(peer.classical);

        let ecdh = ephemeral_secret.diffie_hellman(&peer_classical);
        if !ecdh.was_contributory() {
            return Err(CryptoError::KeyAgreementError(
                "Non-contributory peer X25519 key".to_string(),
            ));
        }

        let mut ikm = Zeroizing::new(Vec::with_capacity(64));
        ikm.extend_from_slice(ecdh.as_bytes());

        let mut ciphertext = ephemeral_public.to_bytes().to_vec();

        if let Some(peer_pq) = &peer.pq {
            let (pq_ciphertext, pq_secret) = pq::encapsulate(peer_pq)?;
            ikm.extend_from_slice(&pq_secret);
            ciphertext.extend_from_slice(&pq_ciphertext);
        }

        let shared_secret = derive_shared_secret(&ciphertext[..CLASSICAL_KEY_LENGTH], &peer.classical, &ikm)?;

        trace!(
            target: "crypto::kem",
            ciphertext_len = ciphertext.len(),
            hybrid = peer.is_hybrid(),
            "Encapsulated shared secret"
        );

        Ok(Encapsulation {
            ciphertext,
            shared_secret,
        })
    }

    /// Декапсулировать shared secret собственным приватным ключом
    pub fn decapsulate(
        &self,
        ciphertext: &[u8],
        keypair: &HybridKeyPair,
    ) -> Result<Zeroizing<[u8; SHARED_SECRET_LENGTH]>> {
        if ciphertext.len() < CLASSICAL_KEY_LENGTH {
            return Err(CryptoError::KeyAgreementError(format!(
                "KEM ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let (ephemeral_bytes, pq_ciphertext) = ciphertext.split_at(CLASSICAL_KEY_LENGTH);
        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(ephemeral_bytes);

        let classical = keypair.classical();
        let ecdh = classical.diffie_hellman(&PublicKey::from(ephemeral))?;

        let mut ikm = Zeroizing::new(Vec::with_capacity(64));
        ikm.extend_from_slice(&ecdh[..]);

        match (keypair.pq(), pq_ciphertext.is_empty()) {
            (None, true) => {}
            (Some(pq_keys), false) => {
                let pq_secret = pq::decapsulate(pq_ciphertext, pq_keys)?;
                ikm.extend_from_slice(&pq_secret);
            }
            (None, false) => {
                return Err(CryptoError::KeyAgreementError(
                    "Hybrid ciphertext for a classical-only key".to_string(),
                ))
            }
            (Some(_), true) => {
                return Err(CryptoError::KeyAgreementError(
                    "Classical-only ciphertext for a hybrid key".to_string(),
                ))
            }
        }

        derive_shared_secret(&ephemeral, &classical.public.to_bytes(), &ikm)
    }
}

fn derive_shared_secret(
    ephemeral_public: &[u8],
    recipient_public: &[u8; 32],
    ikm: &[u8],
) -> Result<Zeroizing<[u8; SHARED_SECRET_LENGTH]>> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), ikm);
    let mut okm = Zeroizing::new([0u8; SHARED_SECRET_LENGTH]);
    hkdf.expand(KEM_INFO, &mut okm[..])
        .map_err(|e| CryptoError::KeyAgreementError(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

#[cfg(feature = "post-quantum")]
mod pq {
    use super::PqKeyPair;
    use crate::error::{CryptoError, Result};
    use pqcrypto_kyber::kyber768;
    use pqcrypto_traits::kem::{Ciphertext, PublicKey, SecretKey, SharedSecret};
    use zeroize::Zeroizing;

    pub const AVAILABLE: bool = true;

    pub fn generate() -> Option<PqKeyPair> {
        let (public, secret) = kyber768::keypair();
        Some(PqKeyPair {
            public: public.as_bytes().to_vec(),
            secret: secret.as_bytes().to_vec(),
        })
    }

    pub fn encapsulate(peer_public: &[u8]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        let public = kyber768::PublicKey::from_bytes(peer_public).map_err(|_| {
            CryptoError::KeyAgreementError(format!(
                "Invalid Kyber-768 public key length: {}",
                peer_public.len()
            ))
        })?;
        let (shared, ciphertext) = kyber768::encapsulate(&public);
        Ok((
            ciphertext.as_bytes().to_vec(),
            Zeroizing::new(shared.as_bytes().to_vec()),
        ))
    }

    pub fn decapsulate(ciphertext: &[u8], keys: &PqKeyPair) -> Result<Zeroizing<Vec<u8>>> {
        let ciphertext = kyber768::Ciphertext::from_bytes(ciphertext).map_err(|_| {
            CryptoError::KeyAgreementError(format!(
                "Invalid Kyber-768 ciphertext length: {}",
                ciphertext.len()
            ))
        })?;
        let secret = kyber768::SecretKey::from_bytes(keys.secret_bytes())
            .map_err(|_| CryptoError::KeyAgreementError("Invalid Kyber-768 secret key".to_string()))?;
        let shared = kyber768::decapsulate(&ciphertext, &secret);
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}

#[cfg(not(feature = "post-quantum"))]
mod pq {
    use super::PqKeyPair;
    use crate::error::{CryptoError, Result};
    use zeroize::Zeroizing;

    pub const AVAILABLE: bool = false;

    pub fn generate() -> Option<PqKeyPair> {
        None
    }

    pub fn encapsulate(_peer_public: &[u8]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        Err(CryptoError::KeyAgreementError(
            "Peer key is hybrid but post-quantum KEM is not available".to_string(),
        ))
    }

    pub fn decapsulate(_ciphertext: &[u8], _keys: &PqKeyPair) -> Result<Zeroizing<Vec<u8>>> {
        Err(CryptoError::KeyAgreementError(
            "Post-quantum KEM is not available".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alice_bob_shared_secret() {
        let kem = KeyEncapsulationService::new();
        let _alice = kem.generate_keypair();
        let bob = kem.generate_keypair();

        let encapsulation = kem.encapsulate(&bob.public_key()).unwrap();
        let ss_b = kem.decapsulate(&encapsulation.ciphertext, &bob).unwrap();

        assert_eq!(*encapsulation.shared_secret, *ss_b);
        assert_eq!(encapsulation.shared_secret.len(), 32);
    }

    #[test]
    fn test_keypair_tag_matches_availability() {
        let kem = KeyEncapsulationService::new();
        let keypair = kem.generate_keypair();
        assert_eq!(keypair.is_hybrid(), kem.is_quantum_resistant());
        assert_eq!(keypair.public_key().is_hybrid(), keypair.is_hybrid());
        if keypair.is_hybrid() {
            assert_eq!(keypair.suite_id(), PQ_HYBRID_SUITE_ID);
        } else {
            assert_eq!(keypair.suite_id(), CLASSIC_SUITE_ID);
        }
    }

    #[test]
    fn test_ciphertext_layout() {
        let kem = KeyEncapsulationService::new();
        let bob = kem.generate_keypair();
        let encapsulation = kem.encapsulate(&bob.public_key()).unwrap();
        if bob.is_hybrid() {
            assert!(encapsulation.ciphertext.len() > CLASSICAL_KEY_LENGTH);
        } else {
            assert_eq!(encapsulation.ciphertext.len(), CLASSICAL_KEY_LENGTH);
        }
    }

    #[test]
    fn test_distinct_keypairs_give_distinct_secrets() {
        let kem = KeyEncapsulationService::new();
        let mut secrets = std::collections::HashSet::new();
        for _ in 0..16 {
            let keypair = kem.generate_keypair();
            let encapsulation = kem.encapsulate(&keypair.public_key()).unwrap();
            assert!(secrets.insert(*encapsulation.shared_secret));
        }
    }

    #[test]
    fn test_wrong_private_key_gives_different_secret() {
        let kem = KeyEncapsulationService::new();
        let bob = kem.generate_keypair();
        let mallory = kem.generate_keypair();
        let encapsulation = kem.encapsulate(&bob.public_key()).unwrap();
        let ss_m = kem.decapsulate(&encapsulation.ciphertext, &mallory).unwrap();
        assert_ne!(*encapsulation.shared_secret, *ss_m);
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let kem = KeyEncapsulationService::new();
        let bob = kem.generate_keypair();
        let result = kem.decapsulate(&[7u8; 31], &bob);
        assert!(matches!(result, Err(CryptoError::KeyAgreementError(_))));
    }

    #[test]
    fn test_low_order_peer_key_rejected() {
        let kem = KeyEncapsulationService::new();
        let peer = KemPublicKey {
            classical: [0u8; 32],
            pq: None,
        };
        assert!(matches!(
            kem.encapsulate(&peer),
            Err(CryptoError::KeyAgreementError(_))
        ));
    }

    #[test]
    fn test_classical_key_rejects_trailing_bytes() {
        let kem = KeyEncapsulationService::new();
        let bob = HybridKeyPair::Classical(ClassicalKeyPair::generate());
        let mut ciphertext = kem.encapsulate(&bob.public_key()).unwrap().ciphertext;
        ciphertext.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            kem.decapsulate(&ciphertext, &bob),
            Err(CryptoError::KeyAgreementError(_))
        ));
    }

    #[cfg(not(feature = "post-quantum"))]
    #[test]
    fn test_hybrid_peer_without_pq_support_is_an_error() {
        let kem = KeyEncapsulationService::new();
        assert!(!kem.is_quantum_resistant());
        let peer = KemPublicKey {
            classical: ClassicalKeyPair::generate().public.to_bytes(),
            pq: Some(vec![0u8; 1184]),
        };
        assert!(matches!(
            kem.encapsulate(&peer),
            Err(CryptoError::KeyAgreementError(_))
        ));
    }

    #[cfg(feature = "post-quantum")]
    #[test]
    fn test_downgraded_hybrid_ciphertext_rejected() {
        let kem = KeyEncapsulationService::new();
        let bob = kem.generate_keypair();
        assert!(bob.is_hybrid());

        // Kyber-часть отрезана: остался только X25519 ephemeral
        let ciphertext = kem.encapsulate(&bob.public_key()).unwrap().ciphertext;
        assert!(matches!(
            kem.decapsulate(&ciphertext[..CLASSICAL_KEY_LENGTH], &bob),
            Err(CryptoError::KeyAgreementError(_))
        ));
    }

    #[cfg(feature = "post-quantum")]
    #[test]
    fn test_malformed_kyber_ciphertext_rejected() {
        let kem = KeyEncapsulationService::new();
        let bob = kem.generate_keypair();
        let ciphertext = kem.encapsulate(&bob.public_key()).unwrap().ciphertext;

        let mut extended = ciphertext.clone();
        extended.push(0);
        assert!(matches!(
            kem.decapsulate(&extended, &bob),
            Err(CryptoError::KeyAgreementError(_))
        ));

        let truncated = &ciphertext[..ciphertext.len() - 1];
        assert!(matches!(
            kem.decapsulate(truncated, &bob),
            Err(CryptoError::KeyAgreementError(_))
        ));
    }

    #[test]
    fn test_public_key_encoding_roundtrip() {
        let kem = KeyEncapsulationService::new();
        let public = kem.generate_keypair().public_key();
        let decoded = KemPublicKey::from_bytes(&public.to_bytes()).unwrap();
        assert_eq!(decoded, public);
        assert!(KemPublicKey::from_bytes(&[0u8; 10]).is_err());
    }
}
