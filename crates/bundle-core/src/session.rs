//! Per-peer ratcheting session and the bundle-id cipher.
//!
//! Both sides derive the same 32-byte root from their static X25519
//! agreement. From the root come:
//!
//!   * one symmetric chain per sending direction. Every message consumes
//!     one step: `mk = KDF(chain, 0x01)`, `chain' = KDF(chain, 0x02)`.
//!     A consumed key is gone, so a byte-identical replay cannot decrypt.
//!   * a fixed bundle-id key, used for the deterministic id transform.
//!
//! A chain is tagged with a random 16-byte epoch. A side that loses its
//! session state starts a new epoch; the receiver adopts it and retires
//! the old one. Messages under a retired epoch are refused.
//!
//! Nothing here touches the filesystem. `SessionState` is plain serde
//! data so the services layer can persist it however it likes.

use std::collections::{BTreeMap, VecDeque};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::{Identity, PeerIdentity};

const ROOT_CONTEXT: &str = "bundle-transmission 2024 session root";
const BUNDLE_ID_CONTEXT: &str = "bundle-transmission 2024 bundle id";

/// Out-of-order message keys kept per receive chain. Also the furthest a
/// single message may jump ahead of the receive chain.
pub const MAX_SKIPPED_KEYS: usize = 1000;

/// Epochs remembered as retired.
const MAX_RETIRED_EPOCHS: usize = 32;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures opening or sealing a bundle.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Signature mismatch, wrong sender, wrong recipient, or AEAD failure.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// No usable session state, or a replayed message.
    #[error("session error: {0}")]
    SessionError(String),

    /// Malformed container, id, or plaintext.
    #[error("format error: {0}")]
    FormatError(String),
}

// ── Direction ─────────────────────────────────────────────────────────────────

/// Which way a bundle travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to server.
    Upstream,
    /// Server to client.
    Downstream,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Upstream => Direction::Downstream,
            Direction::Downstream => Direction::Upstream,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Direction::Upstream => 0x55,
            Direction::Downstream => 0xD5,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x55 => Some(Direction::Upstream),
            0xD5 => Some(Direction::Downstream),
            _ => None,
        }
    }
}

// ── Persisted state ───────────────────────────────────────────────────────────

/// One symmetric chain.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChainState {
    #[serde(with = "hex16")]
    pub epoch: [u8; 16],
    #[serde(with = "hex32")]
    pub key: [u8; 32],
    /// Counter of the next message key this chain will produce.
    pub next: u64,
}

impl Drop for ChainState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Receiving side of a chain, plus keys skipped by out-of-order arrival.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecvState {
    pub chain: ChainState,
    #[serde(default, with = "hex32_map")]
    pub skipped: BTreeMap<u64, [u8; 32]>,
}

/// Everything needed to resume a session after restart.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub peer: PeerIdentity,
    pub send: ChainState,
    pub recv: Option<RecvState>,
    #[serde(default, with = "hex16_list")]
    pub retired_epochs: VecDeque<[u8; 16]>,
}

/// Clear-text header bound into every sealed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sender: PeerIdentity,
    pub recipient: PeerIdentity,
    #[serde(with = "hex16")]
    pub epoch: [u8; 16],
    pub counter: u64,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        // serde_json of plain structs cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecurityError> {
        serde_json::from_slice(bytes).map_err(|e| SecurityError::FormatError(format!("header: {e}")))
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A live session with one peer.
///
/// Not Sync: sealing and opening advance chain state. Callers serialize
/// access per peer.
pub struct Session {
    local: PeerIdentity,
    root: [u8; 32],
    id_key: [u8; 32],
    id_mac_key: [u8; 32],
    state: SessionState,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.root.zeroize();
        self.id_key.zeroize();
        self.id_mac_key.zeroize();
    }
}

impl Session {
    /// Start a brand-new session with `peer` under a fresh send epoch.
    pub fn new(identity: &Identity, peer: PeerIdentity) -> Self {
        let mut epoch = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut epoch);
        let root = derive_root(identity, &peer);
        let send = ChainState {
            epoch,
            key: chain_start(&root, &epoch, &identity.public()),
            next: 0,
        };
        let state = SessionState {
            peer,
            send,
            recv: None,
            retired_epochs: VecDeque::new(),
        };
        Self::assemble(identity, root, state)
    }

    /// Resume from persisted state. The root is re-derived from the keys.
    pub fn resume(identity: &Identity, state: SessionState) -> Result<Self, SecurityError> {
        if state.send.epoch == [0u8; 16] {
            return Err(SecurityError::SessionError("send chain has empty epoch".into()));
        }
        let root = derive_root(identity, &state.peer);
        Ok(Self::assemble(identity, root, state))
    }

    fn assemble(identity: &Identity, root: [u8; 32], state: SessionState) -> Self {
        Self {
            local: identity.public(),
            id_key: id_subkey(&root, b"enc"),
            id_mac_key: id_subkey(&root, b"mac"),
            root,
            state,
        }
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.state.peer
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Encrypt `plaintext` under the next send key. Returns header and ciphertext.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(MessageHeader, Vec<u8>), SecurityError> {
        let header = MessageHeader {
            sender: self.local,
            recipient: self.state.peer,
            epoch: self.state.send.epoch,
            counter: self.state.send.next,
        };
        let (mut mk, next_chain) = step(&self.state.send.key);
        self.state.send.key = next_chain;
        self.state.send.next += 1;

        let aad = header.to_bytes();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&mk));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| SecurityError::FormatError("seal failed".into()));
        mk.zeroize();
        Ok((header, ciphertext?))
    }

    /// Decrypt a message addressed to us by this session's peer.
    ///
    /// Chain state is only committed after the AEAD tag verifies, so a
    /// forged message never burns keys.
    pub fn open(&mut self, header: &MessageHeader, ciphertext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if header.sender != self.state.peer {
            return Err(SecurityError::AuthenticationFailure("sender is not this session's peer".into()));
        }
        if header.recipient != self.local {
            return Err(SecurityError::AuthenticationFailure("bundle addressed to another identity".into()));
        }
        if self.state.retired_epochs.contains(&header.epoch) {
            return Err(SecurityError::SessionError("message from a retired epoch".into()));
        }

        let mut recv = match &self.state.recv {
            Some(r) if r.chain.epoch == header.epoch => r.clone(),
            _ => RecvState {
                chain: ChainState {
                    epoch: header.epoch,
                    key: chain_start(&self.root, &header.epoch, &self.state.peer),
                    next: 0,
                },
                skipped: BTreeMap::new(),
            },
        };

        let mut mk = if header.counter < recv.chain.next {
            recv.skipped
                .remove(&header.counter)
                .ok_or_else(|| SecurityError::SessionError(format!("replayed message {}", header.counter)))?
        } else {
            if header.counter - recv.chain.next > MAX_SKIPPED_KEYS as u64 {
                return Err(SecurityError::SessionError(format!(
                    "message {} too far ahead of chain at {}",
                    header.counter, recv.chain.next
                )));
            }
            while recv.chain.next < header.counter {
                let (skipped, next) = step(&recv.chain.key);
                recv.skipped.insert(recv.chain.next, skipped);
                recv.chain.key = next;
                recv.chain.next += 1;
            }
            let (mk, next) = step(&recv.chain.key);
            recv.chain.key = next;
            recv.chain.next += 1;
            while recv.skipped.len() > MAX_SKIPPED_KEYS {
                recv.skipped.pop_first();
            }
            mk
        };

        let aad = header.to_bytes();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&mk));
        let result = cipher.decrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: ciphertext, aad: &aad });
        mk.zeroize();
        let plaintext =
            result.map_err(|_| SecurityError::AuthenticationFailure("payload AEAD tag mismatch".into()))?;

        // commit
        if let Some(old) = &self.state.recv {
            if old.chain.epoch != header.epoch {
                self.state.retired_epochs.push_back(old.chain.epoch);
                while self.state.retired_epochs.len() > MAX_RETIRED_EPOCHS {
                    self.state.retired_epochs.pop_front();
                }
            }
        }
        self.state.recv = Some(recv);
        Ok(plaintext)
    }

    // ── Bundle ids ────────────────────────────────────────────────────────────

    /// Deterministic keyed transform of `(direction, counter)`.
    ///
    /// Same inputs always give the same id for this peer pair; without the
    /// key the id reveals neither counter nor direction.
    pub fn encrypt_bundle_id(&self, counter: u64, direction: Direction) -> String {
        let plain = id_plaintext(counter, direction);
        let mac = blake3::keyed_hash(&self.id_mac_key, &plain);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&mac.as_bytes()[..12]);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.id_key));
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(12 + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        hex::encode(out)
    }

    pub fn decrypt_bundle_id(&self, id: &str) -> Result<(u64, Direction), SecurityError> {
        let raw = hex::decode(id).map_err(|_| SecurityError::FormatError("bundle id is not hex".into()))?;
        if raw.len() != 12 + 9 + 16 {
            return Err(SecurityError::FormatError(format!("bundle id has length {}", raw.len())));
        }
        let (nonce, ct) = raw.split_at(12);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.id_key));
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| SecurityError::AuthenticationFailure("bundle id not minted by this session".into()))?;

        let mac = blake3::keyed_hash(&self.id_mac_key, &plain);
        if &mac.as_bytes()[..12] != nonce {
            return Err(SecurityError::AuthenticationFailure("bundle id nonce mismatch".into()));
        }
        let direction = Direction::from_tag(plain[0])
            .ok_or_else(|| SecurityError::FormatError("unknown direction tag".into()))?;
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&plain[1..9]);
        Ok((u64::from_be_bytes(counter), direction))
    }

    /// Order two ids of the same direction by their embedded counters.
    pub fn compare_bundle_ids(
        &self,
        a: &str,
        b: &str,
        direction: Direction,
    ) -> Result<std::cmp::Ordering, SecurityError> {
        let (ca, da) = self.decrypt_bundle_id(a)?;
        let (cb, db) = self.decrypt_bundle_id(b)?;
        if da != direction || db != direction {
            return Err(SecurityError::FormatError("bundle id direction mismatch".into()));
        }
        Ok(ca.cmp(&cb))
    }
}

// ── KDF helpers ───────────────────────────────────────────────────────────────

fn derive_root(identity: &Identity, peer: &PeerIdentity) -> [u8; 32] {
    let shared = identity.agree(peer);
    let local = identity.public().to_bytes();
    let remote = peer.to_bytes();
    let (lo, hi) = if local <= remote { (local, remote) } else { (remote, local) };

    let mut hasher = blake3::Hasher::new_derive_key(ROOT_CONTEXT);
    hasher.update(&*shared);
    hasher.update(&lo);
    hasher.update(&hi);
    *hasher.finalize().as_bytes()
}

/// First key of the chain `sender` sends on during `epoch`.
fn chain_start(root: &[u8; 32], epoch: &[u8; 16], sender: &PeerIdentity) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(root);
    hasher.update(b"chain");
    hasher.update(epoch);
    hasher.update(&sender.to_bytes());
    *hasher.finalize().as_bytes()
}

fn id_subkey(root: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(root);
    hasher.update(BUNDLE_ID_CONTEXT.as_bytes());
    hasher.update(label);
    *hasher.finalize().as_bytes()
}

/// One ratchet step: (message key, next chain key).
fn step(chain: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mk = blake3::keyed_hash(chain, &[0x01]);
    let next = blake3::keyed_hash(chain, &[0x02]);
    (*mk.as_bytes(), *next.as_bytes())
}

fn id_plaintext(counter: u64, direction: Direction) -> [u8; 9] {
    let mut plain = [0u8; 9];
    plain[0] = direction.tag();
    plain[1..].copy_from_slice(&counter.to_be_bytes());
    plain
}

// ── Serde helpers ─────────────────────────────────────────────────────────────

fn decode_fixed<const N: usize, E: serde::de::Error>(s: &str) -> Result<[u8; N], E> {
    let bytes = hex::decode(s).map_err(E::custom)?;
    bytes
        .try_into()
        .map_err(|_| E::custom(format!("expected {N} bytes")))
}

mod hex16 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode_fixed(&s)
    }
}

mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode_fixed(&s)
    }
}

mod hex32_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(map: &BTreeMap<u64, [u8; 32]>, serializer: S) -> Result<S::Ok, S::Error> {
        let as_hex: BTreeMap<u64, String> = map.iter().map(|(k, v)| (*k, hex::encode(v))).collect();
        as_hex.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<u64, [u8; 32]>, D::Error> {
        let as_hex = BTreeMap::<u64, String>::deserialize(deserializer)?;
        as_hex
            .into_iter()
            .map(|(k, v)| super::decode_fixed(&v).map(|key| (k, key)))
            .collect()
    }
}

mod hex16_list {
    use std::collections::VecDeque;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(list: &VecDeque<[u8; 16]>, serializer: S) -> Result<S::Ok, S::Error> {
        let as_hex: Vec<String> = list.iter().map(hex::encode).collect();
        as_hex.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<VecDeque<[u8; 16]>, D::Error> {
        let as_hex = Vec::<String>::deserialize(deserializer)?;
        as_hex.iter().map(|s| super::decode_fixed(s)).collect()
    }
}
