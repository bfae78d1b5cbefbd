//! Double Ratchet Engine
//!
//! ## Архитектура
//!
//! Double Ratchet состоит из двух ratchets:
//! 1. **DH Ratchet**: ротация X25519 ключей при каждой смене направления диалога
//! 2. **Symmetric Ratchet**: HKDF-шаг chain key для каждого сообщения
//!
//! ## KDF
//!
//! ```text
//! initialize:   HKDF(ikm = root_secret, info = INIT)[..96]
//!               = root || chain(i→r) || chain(r→i)
//! root step:    HKDF(salt = root, ikm = DH, info = ROOT)[..64]
//!               = root' || chain
//! chain step:   message_key = HKDF-Expand(chain, "…message-key")
//!               chain'      = HKDF-Expand(chain, "…chain-key")
//! ```
//!
//! ## Фазы
//!
//! `Uninitialized → Initialized → Ratcheting`, терминальная `Erased`.

use crate::config::Config;
use crate::crypto::kem::ClassicalKeyPair;
use crate::crypto::messaging::skipped_keys::{SkippedKeyCache, SkippedKeyRecord};
use crate::crypto::messaging::{ChainLengths, Direction, MessageHeader, Role};
use crate::error::{CryptoError, Result};
use crate::utils::time::current_timestamp;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::VecDeque;
use x25519_dalek::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const ROOT_KEY_LENGTH: usize = 32;
pub const CHAIN_KEY_LENGTH: usize = 32;

const INIT_INFO: &[u8] = b"Construct-DoubleRatchet-Init-v1";
const ROOT_INFO: &[u8] = b"Construct-DoubleRatchet-Root-v1";
const MESSAGE_KEY_INFO: &[u8] = b"Construct-DoubleRatchet-message-key";
const CHAIN_KEY_INFO: &[u8] = b"Construct-DoubleRatchet-chain-key";

/// Фаза жизненного цикла движка
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetPhase {
    Uninitialized,
    Initialized,
    Ratcheting,
    Erased,
}

#[derive(Clone)]
struct ChainState {
    key: Zeroizing<[u8; CHAIN_KEY_LENGTH]>,
    counter: u32,
}

impl ChainState {
    fn empty() -> Self {
        Self {
            key: Zeroizing::new([0u8; CHAIN_KEY_LENGTH]),
            counter: 0,
        }
    }

    fn new(key: Zeroizing<[u8; CHAIN_KEY_LENGTH]>) -> Self {
        Self { key, counter: 0 }
    }
}

/// Double Ratchet для одной сессии
///
/// ### Root Key
/// - Обновляется при каждом DH ratchet step
///
/// ### Chain Keys
/// - `send_chain` / `recv_chain`: ключ цепочки + счётчик сообщений
///
/// ### DH Ratchet Keys
/// - `local_ratchet`: наша текущая X25519 пара (public уходит в заголовках)
/// - `remote_ratchet`: последний принятый ratchet key собеседника
/// - `previous_remote_keys`: ранее принятые ключи (повтор отклоняется)
#[derive(Clone)]
pub struct DoubleRatchetEngine {
    phase: RatchetPhase,
    role: Role,

    root_key: Zeroizing<[u8; ROOT_KEY_LENGTH]>,
    send_chain: ChainState,
    recv_chain: ChainState,

    local_ratchet: Option<ClassicalKeyPair>,
    remote_ratchet: Option<[u8; 32]>,
    previous_remote_keys: VecDeque<[u8; 32]>,

    generation: u32,
    previous_chain_lengths: ChainLengths,

    skipped: SkippedKeyCache,
    max_skipped_messages: u32,
    remembered_ratchet_keys: usize,
}

impl DoubleRatchetEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            phase: RatchetPhase::Uninitialized,
            role: Role::Initiator,
            root_key: Zeroizing::new([0u8; ROOT_KEY_LENGTH]),
            send_chain: ChainState::empty(),
            recv_chain: ChainState::empty(),
            local_ratchet: None,
            remote_ratchet: None,
            previous_remote_keys: VecDeque::new(),
            generation: 0,
            previous_chain_lengths: ChainLengths::default(),
            skipped: SkippedKeyCache::new(
                config.max_skipped_messages as usize,
                config.max_skipped_message_age_seconds,
            ),
            max_skipped_messages: config.max_skipped_messages,
            remembered_ratchet_keys: config.remembered_ratchet_keys,
        }
    }

    /// Инициализировать цепочки из root secret (результат X3DH)
    pub fn initialize(&mut self, root_secret: &[u8], role: Role) -> Result<()> {
        use tracing::debug;

        if self.phase == RatchetPhase::Erased {
            return Err(CryptoError::SessionTerminated);
        }
        if root_secret.len() != ROOT_KEY_LENGTH {
            return Err(CryptoError::invalid_length(ROOT_KEY_LENGTH, root_secret.len()));
        }

        let hkdf = Hkdf::<Sha256>::new(None, root_secret);
        let mut okm = Zeroizing::new([0u8; 96]);
        hkdf.expand(INIT_INFO, &mut okm[..])
            .map_err(|e| CryptoError::InternalError(format!("HKDF expand failed: {}", e)))?;

        let mut root = Zeroizing::new([0u8; ROOT_KEY_LENGTH]);
        let mut initiator_chain = Zeroizing::new([0u8; CHAIN_KEY_LENGTH]);
        let mut responder_chain = Zeroizing::new([0u8; CHAIN_KEY_LENGTH]);
        root.copy_from_slice(&okm[..32]);
        initiator_chain.copy_from_slice(&okm[32..64]);
        responder_chain.copy_from_slice(&okm[64..]);

        let (send, recv) = match role {
            Role::Initiator => (initiator_chain, responder_chain),
            Role::Responder => (responder_chain, initiator_chain),
        };

        self.role = role;
        self.root_key = root;
        self.send_chain = ChainState::new(send);
        self.recv_chain = ChainState::new(recv);
        self.local_ratchet = Some(ClassicalKeyPair::generate());
        self.remote_ratchet = None;
        self.previous_remote_keys.clear();
        self.generation = 0;
        self.previous_chain_lengths = ChainLengths::default();
        self.skipped.clear();
        self.phase = RatchetPhase::Initialized;

        debug!(target: "crypto::double_ratchet", ?role, "Ratchet initialized");
        Ok(())
    }

    pub fn phase(&self) -> RatchetPhase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn counter(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Send => self.send_chain.counter,
            Direction::Recv => self.recv_chain.counter,
        }
    }

    pub fn previous_chain_lengths(&self) -> ChainLengths {
        self.previous_chain_lengths
    }

    pub fn local_ratchet_public(&self) -> Result<[u8; 32]> {
        self.ensure_active()?;
        self.local_ratchet
            .as_ref()
            .map(|keypair| keypair.public.to_bytes())
            .ok_or(CryptoError::ChainNotInitializedError)
    }

    pub fn remote_ratchet_public(&self) -> Option<[u8; 32]> {
        self.remote_ratchet
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Может ли движок отправлять: responder ждёт первый ratchet key собеседника
    pub fn can_send(&self) -> bool {
        match self.phase {
            RatchetPhase::Ratcheting => true,
            RatchetPhase::Initialized => self.role == Role::Initiator,
            _ => false,
        }
    }

    /// DH ratchet step с новым ratchet key собеседника
    ///
    /// Возвращает наш новый ratchet public key. Повторно предъявленный ключ
    /// (текущий или один из запомненных) отклоняется с `StaleRatchetKey`,
    /// состояние при этом не меняется.
    pub fn perform_dh_ratchet(&mut self, peer_ratchet_public: &[u8; 32]) -> Result<[u8; 32]> {
        use tracing::debug;

        self.ensure_active()?;

        if self.remote_ratchet.as_ref() == Some(peer_ratchet_public)
            || self.previous_remote_keys.contains(peer_ratchet_public)
        {
            debug!(target: "crypto::double_ratchet", generation = self.generation, "Rejected stale ratchet key");
            return Err(CryptoError::StaleRatchetKey);
        }

        let local = self
            .local_ratchet
            .as_ref()
            .ok_or(CryptoError::ChainNotInitializedError)?;
        let peer = PublicKey::from(*peer_ratchet_public);

        // Всё вычисляется во временных значениях; состояние меняется только в конце
        let mut root = self.root_key.clone();
        let mut recv_key = self.recv_chain.key.clone();

        // Receive step. У responder при первом контакте ключ собеседника ещё не
        // участвовал в root: его первая цепочка получена при initialize.
        let first_contact = self.role == Role::Responder && self.remote_ratchet.is_none();
        if !first_contact {
            let dh = local.diffie_hellman(&peer)?;
            let (next_root, chain) = kdf_root(&root, &dh)?;
            root = next_root;
            recv_key = chain;
        }

        // Send step с новой локальной парой
        let new_local = ClassicalKeyPair::generate();
        let dh = new_local.diffie_hellman(&peer)?;
        let (next_root, send_key) = kdf_root(&root, &dh)?;

        let generation = self
            .generation
            .checked_add(1)
            .ok_or_else(|| CryptoError::InternalError("ratchet generation overflow".to_string()))?;
        let new_public = new_local.public.to_bytes();

        self.previous_chain_lengths = ChainLengths {
            send: self.send_chain.counter,
            recv: self.recv_chain.counter,
        };
        self.root_key = next_root;
        self.recv_chain = ChainState::new(recv_key);
        self.send_chain = ChainState::new(send_key);
        if let Some(previous) = self.remote_ratchet.replace(*peer_ratchet_public) {
            self.previous_remote_keys.push_front(previous);
            self.previous_remote_keys.truncate(self.remembered_ratchet_keys);
        }
        self.local_ratchet = Some(new_local);
        self.generation = generation;
        self.phase = RatchetPhase::Ratcheting;

        let evicted = self.skipped.evict_before_generation(generation.saturating_sub(1));

        debug!(
            target: "crypto::double_ratchet",
            generation,
            first_contact,
            previous_send = self.previous_chain_lengths.send,
            previous_recv = self.previous_chain_lengths.recv,
            evicted_skipped_keys = evicted,
            "DH ratchet step completed"
        );

        Ok(new_public)
    }

    /// Вывести следующий message key и продвинуть цепочку
    pub fn derive_message_key(&mut self, direction: Direction) -> Result<Zeroizing<[u8; 32]>> {
        self.ensure_active()?;
        if direction == Direction::Send && !self.can_send() {
            return Err(CryptoError::ChainNotInitializedError);
        }

        let chain = match direction {
            Direction::Send => &mut self.send_chain,
            Direction::Recv => &mut self.recv_chain,
        };

        let next_counter = chain
            .counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::InternalError("chain counter overflow".to_string()))?;

        let hkdf = Hkdf::<Sha256>::from_prk(&chain.key[..])
            .map_err(|_| CryptoError::invalid_length(CHAIN_KEY_LENGTH, chain.key.len()))?;

        let mut message_key = Zeroizing::new([0u8; 32]);
        let mut next_chain = Zeroizing::new([0u8; CHAIN_KEY_LENGTH]);
        hkdf.expand(MESSAGE_KEY_INFO, &mut message_key[..])
            .map_err(|e| CryptoError::InternalError(format!("HKDF expand failed: {}", e)))?;
        hkdf.expand(CHAIN_KEY_INFO, &mut next_chain[..])
            .map_err(|e| CryptoError::InternalError(format!("HKDF expand failed: {}", e)))?;

        chain.key = next_chain;
        chain.counter = next_counter;

        tracing::trace!(
            target: "crypto::double_ratchet",
            ?direction,
            counter = next_counter - 1,
            "Derived message key"
        );

        Ok(message_key)
    }

    /// Ключ и заголовок для следующего исходящего сообщения
    pub fn next_send_key(&mut self) -> Result<(MessageHeader, Zeroizing<[u8; 32]>)> {
        let ratchet_public = self.local_ratchet_public()?;
        let counter = self.send_chain.counter;
        let message_key = self.derive_message_key(Direction::Send)?;
        Ok((
            MessageHeader {
                ratchet_public,
                counter,
                previous_chain_length: self.previous_chain_lengths.send,
            },
            message_key,
        ))
    }

    /// Ключ для входящего сообщения
    ///
    /// - ключ заголовка совпадает с текущим: догоняем recv chain
    ///   (пропущенные ключи уходят в кэш) или берём ключ из кэша;
    /// - ключ заголовка предыдущий: только из кэша;
    /// - новый ключ: дозаполняем кэш до `previous_chain_length`,
    ///   выполняем DH ratchet и догоняем новую цепочку.
    pub fn receive_key(&mut self, header: &MessageHeader) -> Result<Zeroizing<[u8; 32]>> {
        use tracing::debug;

        self.ensure_active()?;
        let peer = header.ratchet_public;

        if self.remote_ratchet == Some(peer) {
            return self.receive_in_current_chain(header.counter);
        }

        if self.previous_remote_keys.front() == Some(&peer) {
            let generation = self.generation.saturating_sub(1);
            return self
                .skipped
                .take(generation, header.counter)
                .ok_or_else(|| missing_key(generation, header.counter));
        }

        if self.previous_remote_keys.contains(&peer) {
            debug!(target: "crypto::double_ratchet", generation = self.generation, "Rejected stale ratchet key");
            return Err(CryptoError::StaleRatchetKey);
        }

        if self.remote_ratchet.is_some() {
            self.check_skip(self.recv_chain.counter, header.previous_chain_length)?;
        }
        self.check_skip(0, header.counter)?;

        // Новая цепочка собирается на копии: при ошибке движок не меняется
        let mut next = self.clone();
        if next.remote_ratchet.is_some() {
            next.stash_until(header.previous_chain_length)?;
        }
        next.perform_dh_ratchet(&peer)?;
        let key = next.receive_in_current_chain(header.counter)?;
        *self = next;
        Ok(key)
    }

    /// Удалить просроченные пропущенные ключи
    pub fn sweep_skipped_keys(&mut self, now: i64) -> usize {
        let removed = self.skipped.sweep_expired(now);
        if removed > 0 {
            tracing::debug!(
                target: "crypto::double_ratchet",
                removed,
                remaining = self.skipped.len(),
                "Cleaned up old skipped message keys"
            );
        }
        removed
    }

    /// Обнулить всё ключевое состояние; дальнейшие операции → `SessionTerminated`
    pub fn erase(&mut self) {
        self.root_key.zeroize();
        self.send_chain.key.zeroize();
        self.recv_chain.key.zeroize();
        self.send_chain.counter = 0;
        self.recv_chain.counter = 0;
        self.local_ratchet = None;
        self.remote_ratchet = None;
        self.previous_remote_keys.clear();
        self.skipped.clear();
        self.phase = RatchetPhase::Erased;
        tracing::debug!(target: "crypto::double_ratchet", "Ratchet state erased");
    }

    /// Snapshot для внешнего хранения
    pub fn to_state(&self) -> Result<RatchetState> {
        self.ensure_active()?;
        Ok(RatchetState {
            phase: self.phase,
            role: self.role,
            root_key: *self.root_key,
            send_chain_key: *self.send_chain.key,
            send_counter: self.send_chain.counter,
            recv_chain_key: *self.recv_chain.key,
            recv_counter: self.recv_chain.counter,
            local_ratchet_secret: self.local_ratchet.as_ref().map(|k| k.secret.to_bytes()),
            remote_ratchet_public: self.remote_ratchet,
            previous_remote_keys: self.previous_remote_keys.iter().copied().collect(),
            generation: self.generation,
            previous_chain_lengths: self.previous_chain_lengths,
            skipped_keys: self.skipped.to_records(),
        })
    }

    /// Восстановить из snapshot
    pub fn from_state(state: &RatchetState, config: &Config) -> Result<Self> {
        if matches!(state.phase, RatchetPhase::Uninitialized | RatchetPhase::Erased) {
            return Err(CryptoError::InvalidInputError(format!(
                "Cannot restore ratchet in phase {:?}",
                state.phase
            )));
        }
        let local_secret = state.local_ratchet_secret.ok_or_else(|| {
            CryptoError::InvalidInputError("Ratchet snapshot without local key".to_string())
        })?;

        let mut engine = Self::new(config);
        engine.phase = state.phase;
        engine.role = state.role;
        engine.root_key = Zeroizing::new(state.root_key);
        engine.send_chain = ChainState {
            key: Zeroizing::new(state.send_chain_key),
            counter: state.send_counter,
        };
        engine.recv_chain = ChainState {
            key: Zeroizing::new(state.recv_chain_key),
            counter: state.recv_counter,
        };
        engine.local_ratchet = Some(ClassicalKeyPair::from_secret_bytes(local_secret));
        engine.remote_ratchet = state.remote_ratchet_public;
        engine.previous_remote_keys = state.previous_remote_keys.iter().copied().collect();
        engine.generation = state.generation;
        engine.previous_chain_lengths = state.previous_chain_lengths;
        engine.skipped.restore(&state.skipped_keys);
        Ok(engine)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.phase {
            RatchetPhase::Uninitialized => Err(CryptoError::ChainNotInitializedError),
            RatchetPhase::Erased => Err(CryptoError::SessionTerminated),
            RatchetPhase::Initialized | RatchetPhase::Ratcheting => Ok(()),
        }
    }

    fn check_skip(&self, from: u32, to: u32) -> Result<()> {
        let requested = to.saturating_sub(from);
        if requested > self.max_skipped_messages {
            return Err(CryptoError::TooManySkippedMessages {
                requested,
                limit: self.max_skipped_messages,
            });
        }
        Ok(())
    }

    fn receive_in_current_chain(&mut self, counter: u32) -> Result<Zeroizing<[u8; 32]>> {
        if counter < self.recv_chain.counter {
            return self
                .skipped
                .take(self.generation, counter)
                .ok_or_else(|| missing_key(self.generation, counter));
        }
        self.check_skip(self.recv_chain.counter, counter)?;
        self.stash_until(counter)?;
        self.derive_message_key(Direction::Recv)
    }

    fn stash_until(&mut self, target: u32) -> Result<()> {
        let now = current_timestamp();
        while self.recv_chain.counter < target {
            let counter = self.recv_chain.counter;
            let key = self.derive_message_key(Direction::Recv)?;
            self.skipped.insert(self.generation, counter, key, now);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DoubleRatchetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchetEngine")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("send_counter", &self.send_chain.counter)
            .field("recv_counter", &self.recv_chain.counter)
            .field("skipped", &self.skipped)
            .finish()
    }
}

fn kdf_root(
    root: &[u8; ROOT_KEY_LENGTH],
    dh_output: &[u8; 32],
) -> Result<(Zeroizing<[u8; ROOT_KEY_LENGTH]>, Zeroizing<[u8; CHAIN_KEY_LENGTH]>)> {
    let hkdf = Hkdf::<Sha256>::new(Some(&root[..]), &dh_output[..]);
    let mut okm = Zeroizing::new([0u8; ROOT_KEY_LENGTH + CHAIN_KEY_LENGTH]);
    hkdf.expand(ROOT_INFO, &mut okm[..])
        .map_err(|e| CryptoError::InternalError(format!("KDF_RK failed: {}", e)))?;

    let mut next_root = Zeroizing::new([0u8; ROOT_KEY_LENGTH]);
    let mut chain = Zeroizing::new([0u8; CHAIN_KEY_LENGTH]);
    next_root.copy_from_slice(&okm[..ROOT_KEY_LENGTH]);
    chain.copy_from_slice(&okm[ROOT_KEY_LENGTH..]);
    Ok((next_root, chain))
}

fn missing_key(generation: u32, counter: u32) -> CryptoError {
    CryptoError::KeyNotFoundError(format!("message key {}:{}", generation, counter))
}

/// Сериализуемый snapshot состояния ratchet. Обнуляется при drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    #[zeroize(skip)]
    pub phase: RatchetPhase,
    #[zeroize(skip)]
    pub role: Role,
    pub root_key: [u8; 32],
    pub send_chain_key: [u8; 32],
    pub send_counter: u32,
    pub recv_chain_key: [u8; 32],
    pub recv_counter: u32,
    pub local_ratchet_secret: Option<[u8; 32]>,
    pub remote_ratchet_public: Option<[u8; 32]>,
    pub previous_remote_keys: Vec<[u8; 32]>,
    pub generation: u32,
    #[zeroize(skip)]
    pub previous_chain_lengths: ChainLengths,
    pub skipped_keys: Vec<SkippedKeyRecord>,
}
