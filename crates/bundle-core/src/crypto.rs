//! Long-term identity keys.
//!
//! Every party (client, server) owns one identity made of two keypairs:
//!   1. X25519 static keypair — key agreement for per-peer sessions
//!   2. Ed25519 signing keypair — signatures over bundle ciphertext
//!
//! The public half of both is the party's `PeerIdentity`; the short
//! `PeerId` derived from it names directories and log fields.
//!
//! All private key material is zeroized on drop.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A static X25519 keypair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        Self::from_private(secret.to_bytes())
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// X25519 agreement with a peer's static public key.
    pub fn agree(&self, peer_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let secret = StaticSecret::from(*self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
        Zeroizing::new(*shared.as_bytes())
    }
}

// ── Peer identity ─────────────────────────────────────────────────────────────

/// Public identity of a party: agreement key and verifying key.
///
/// Serialized as 128 hex characters (`dh || sign`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub dh_public: [u8; 32],
    pub sign_public: [u8; 32],
}

impl PeerIdentity {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.dh_public);
        out[32..].copy_from_slice(&self.sign_public);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::BadIdentity(format!("expected 64 bytes, got {}", bytes.len())));
        }
        let mut dh_public = [0u8; 32];
        let mut sign_public = [0u8; 32];
        dh_public.copy_from_slice(&bytes[..32]);
        sign_public.copy_from_slice(&bytes[32..]);
        // reject keys that cannot verify anything
        VerifyingKey::from_bytes(&sign_public)
            .map_err(|e| CryptoError::BadIdentity(e.to_string()))?;
        Ok(Self { dh_public, sign_public })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::BadIdentity(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Short stable name for this identity.
    pub fn id(&self) -> PeerId {
        let digest = hash(&self.to_bytes());
        PeerId(hex::encode(&digest[..16]))
    }

    /// Verify an Ed25519 signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.sign_public)
            .map_err(|e| CryptoError::BadIdentity(e.to_string()))?;
        let bytes: [u8; 64] = signature.try_into().map_err(|_| CryptoError::BadSignature)?;
        key.verify(message, &Signature::from_bytes(&bytes))
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl Serialize for PeerIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Short hex name of a peer (first 16 bytes of BLAKE3 over its identity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts only the 32-character lowercase hex form `id()` produces.
    pub fn parse(s: &str) -> Option<Self> {
        let ok = s.len() == 32 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        ok.then(|| Self(s.to_string()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Size of the identity key file: X25519 private || Ed25519 private.
const IDENTITY_FILE_LEN: usize = 64;

/// The local party's long-term keys.
pub struct Identity {
    dh: Keypair,
    signing: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            dh: Keypair::generate(),
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_FILE_LEN {
            return Err(CryptoError::BadIdentity(format!(
                "identity file must be {IDENTITY_FILE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut dh = Zeroizing::new([0u8; 32]);
        let mut sign = Zeroizing::new([0u8; 32]);
        dh.copy_from_slice(&bytes[..32]);
        sign.copy_from_slice(&bytes[32..]);
        Ok(Self {
            dh: Keypair::from_private(*dh),
            signing: SigningKey::from_bytes(&sign),
        })
    }

    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(IDENTITY_FILE_LEN));
        out.extend_from_slice(&*self.dh.private_bytes());
        out.extend_from_slice(self.signing.as_bytes());
        out
    }

    /// Load the identity at `path`, generating and persisting one if absent.
    ///
    /// A present but unreadable file is an error: losing the identity
    /// silently would orphan every peer session.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                Self::from_secret_bytes(&bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save(path)?;
                Ok(identity)
            }
            Err(e) => Err(CryptoError::Io(e)),
        }
    }

    /// Write the private keys with mode 0600.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &*self.secret_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn public(&self) -> PeerIdentity {
        PeerIdentity {
            dh_public: self.dh.public,
            sign_public: self.signing.verifying_key().to_bytes(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.public().id()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Static X25519 agreement with `peer`.
    pub fn agree(&self, peer: &PeerIdentity) -> Zeroizing<[u8; 32]> {
        self.dh.agree(&peer.dh_public)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid identity: {0}")]
    BadIdentity(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("identity i/o: {0}")]
    Io(#[from] std::io::Error),
}
