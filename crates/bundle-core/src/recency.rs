//! Recency blobs — signed server heartbeats relayed by transports.
//!
//! The server signs a small `{version, nonce, timestamp, sender_id}`
//! record. A transport fetches it whenever it reaches the server and hands
//! it to clients; a client uses it to judge how recently each transport
//! talked to the server. Clients check the signer against the server
//! identity they were configured with.

use std::collections::HashMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{Identity, PeerIdentity};

pub const RECENCY_VERSION: u32 = 1;

/// Future timestamps tolerated for clock skew.
pub const MAX_FUTURE_SKEW_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyBlob {
    pub version: u32,
    pub nonce: u64,
    /// Unix seconds at signing.
    pub timestamp: u64,
    pub sender_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecencyBlob {
    pub blob: RecencyBlob,
    /// Hex public identity of the signer.
    pub signer: PeerIdentity,
    /// Hex Ed25519 signature over the JSON of `blob`.
    pub signature: String,
}

#[derive(Debug, Error)]
pub enum RecencyError {
    #[error("unsupported recency blob version {0}")]
    Version(u32),

    #[error("signed by {0}, not the configured server")]
    WrongSigner(String),

    #[error("bad recency signature")]
    BadSignature,

    #[error("timestamp {timestamp} is {ahead}s in the future")]
    FromTheFuture { timestamp: u64, ahead: u64 },
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SignedRecencyBlob {
    pub fn sign(identity: &Identity, timestamp: u64) -> Self {
        let blob = RecencyBlob {
            version: RECENCY_VERSION,
            nonce: rand::thread_rng().next_u64(),
            timestamp,
            sender_id: identity.id().to_string(),
        };
        let signature = identity.sign(&blob_bytes(&blob));
        Self {
            blob,
            signer: identity.public(),
            signature: hex::encode(signature),
        }
    }

    /// Check version, signer, signature and clock skew against `now`.
    pub fn verify(&self, server: &PeerIdentity, now: u64) -> Result<(), RecencyError> {
        if self.blob.version != RECENCY_VERSION {
            return Err(RecencyError::Version(self.blob.version));
        }
        if &self.signer != server {
            return Err(RecencyError::WrongSigner(self.signer.id().to_string()));
        }
        let signature = hex::decode(&self.signature).map_err(|_| RecencyError::BadSignature)?;
        server
            .verify(&blob_bytes(&self.blob), &signature)
            .map_err(|_| RecencyError::BadSignature)?;
        if self.blob.timestamp > now + MAX_FUTURE_SKEW_SECS {
            return Err(RecencyError::FromTheFuture {
                timestamp: self.blob.timestamp,
                ahead: self.blob.timestamp - now,
            });
        }
        Ok(())
    }
}

fn blob_bytes(blob: &RecencyBlob) -> Vec<u8> {
    serde_json::to_vec(blob).unwrap_or_default()
}

/// Newest verified blob per transport, as seen by a client.
pub struct RecencyTracker {
    server: PeerIdentity,
    newest: HashMap<String, RecencyBlob>,
}

impl RecencyTracker {
    pub fn new(server: PeerIdentity) -> Self {
        Self {
            server,
            newest: HashMap::new(),
        }
    }

    /// Verify and record. Returns true if this is now the newest blob
    /// for `transport_id`; older-but-valid blobs are ignored.
    pub fn observe(
        &mut self,
        transport_id: &str,
        blob: &SignedRecencyBlob,
        now: u64,
    ) -> Result<bool, RecencyError> {
        blob.verify(&self.server, now)?;
        let newer = self
            .newest
            .get(transport_id)
            .map_or(true, |known| blob.blob.timestamp > known.timestamp);
        if newer {
            self.newest.insert(transport_id.to_string(), blob.blob.clone());
        }
        Ok(newer)
    }

    pub fn newest(&self, transport_id: &str) -> Option<&RecencyBlob> {
        self.newest.get(transport_id)
    }

    /// Transport whose last server contact is most recent.
    pub fn freshest_transport(&self) -> Option<(&str, u64)> {
        self.newest
            .iter()
            .max_by_key(|(_, b)| b.timestamp)
            .map(|(id, b)| (id.as_str(), b.timestamp))
    }
}
