//! Peer directory — public identities this node has exchanged bundles with.
//!
//! A server learns a client the first time one of its bundles passes
//! signature verification; the identity inside the bundle header is
//! self-certifying. Only known clients get bundles generated for them.
//!
//! When constructed with a persist path, the directory is written on
//! every new peer and reloaded on startup.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use bundle_core::crypto::{PeerId, PeerIdentity};
use bundle_core::recency::unix_now;
use bundle_core::recovery::{load_json, Recovery};

use crate::persist::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub identity: PeerIdentity,
    /// Unix seconds.
    pub first_seen: u64,
    pub last_seen: u64,
}

#[derive(Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<DashMap<PeerId, PeerRecord>>,
    persist_path: Arc<Option<PathBuf>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(path: PathBuf) -> Self {
        let directory = Self {
            peers: Arc::new(DashMap::new()),
            persist_path: Arc::new(Some(path)),
        };
        directory.load_from_disk();
        directory
    }

    /// Record contact with `identity`. Returns true if the peer is new.
    pub fn observe(&self, identity: &PeerIdentity) -> bool {
        let now = unix_now();
        let id = identity.id();
        let is_new = match self.peers.get_mut(&id) {
            Some(mut record) => {
                record.last_seen = now;
                false
            }
            None => {
                self.peers.insert(
                    id.clone(),
                    PeerRecord {
                        identity: *identity,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                true
            }
        };
        if is_new {
            tracing::info!(peer = %id, "new peer");
            self.save_to_disk();
        }
        is_new
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerIdentity> {
        self.peers.get(id).map(|r| r.identity)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn list(&self) -> Vec<(PeerId, PeerRecord)> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerDirectory {
    /// Best-effort: logs on failure.
    fn save_to_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let snapshot: BTreeMap<PeerId, PeerRecord> = self
            .peers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if let Err(e) = write_json_atomic(path, &snapshot) {
            tracing::warn!(error = %e, path = %path.display(), "failed to persist peer directory");
        }
    }

    fn load_from_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let snapshot = match load_json(path, BTreeMap::<PeerId, PeerRecord>::new) {
            Recovery::Loaded(s) => s,
            Recovery::Recovered { value, reason } => {
                tracing::warn!(reason = %reason, "peer directory unreadable, starting empty");
                value
            }
            Recovery::Fatal(e) => {
                tracing::warn!(error = %format!("{:#}", anyhow::Error::new(e)), "failed to read peer directory");
                return;
            }
        };
        let mut loaded = 0;
        for (id, record) in snapshot {
            if record.identity.id() != id {
                tracing::warn!(peer = %id, "peer record does not match its identity, skipping");
                continue;
            }
            self.peers.insert(id, record);
            loaded += 1;
        }
        if loaded > 0 {
            tracing::info!(count = loaded, "loaded peer directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundle_core::crypto::Identity;

    #[test]
    fn observe_reports_new_once() {
        let dir = PeerDirectory::new();
        let peer = Identity::generate().public();
        assert!(dir.observe(&peer));
        assert!(!dir.observe(&peer));
        assert_eq!(dir.get(&peer.id()), Some(peer));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn persistence_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.json");
        let peer = Identity::generate().public();

        PeerDirectory::with_persistence(path.clone()).observe(&peer);
        let reloaded = PeerDirectory::with_persistence(path);
        assert!(reloaded.contains(&peer.id()));
    }
}
