//! Per-peer transmission bookkeeping.
//!
//! One JSON record per peer at `{root}/{peer}.json`:
//! - `ack`: newest peer bundle applied here; embedded in every outbound payload
//! - `last_sent`: the bundle to reuse when the next assembly is identical
//! - `sent`: every unacknowledged bundle with the per-app max ADU id it carried
//! - `largest_received`: highest peer counter ever applied

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use bundle_core::crypto::PeerId;
use bundle_core::recovery::{load_json, Recovery};

use crate::persist::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRecord {
    pub bundle_id: String,
    pub counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSent {
    pub bundle_id: String,
    pub counter: u64,
    /// Hex BLAKE3 fingerprint of the payload.
    pub fingerprint: String,
    #[serde(default)]
    pub adu_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    pub counter: u64,
    /// Highest ADU id included per application.
    pub apps: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerLedger {
    pub ack: Option<AckRecord>,
    pub last_sent: Option<LastSent>,
    pub sent: BTreeMap<String, SentRecord>,
    pub largest_received: Option<u64>,
}

impl PeerLedger {
    /// Record a freshly minted bundle as the one to retransmit.
    pub fn record_sent(
        &mut self,
        bundle_id: &str,
        counter: u64,
        fingerprint: [u8; 32],
        adu_count: usize,
        apps: BTreeMap<String, u64>,
    ) {
        self.sent
            .insert(bundle_id.to_string(), SentRecord { counter, apps });
        self.last_sent = Some(LastSent {
            bundle_id: bundle_id.to_string(),
            counter,
            fingerprint: hex::encode(fingerprint),
            adu_count,
        });
    }

    /// Remove every sent record with counter `<= acked`.
    ///
    /// Returns the retired bundle ids and, per app, the highest ADU id the
    /// peer has now proven it holds.
    pub fn retire_acked(&mut self, acked: u64) -> (Vec<String>, BTreeMap<String, u64>) {
        let retired: Vec<String> = self
            .sent
            .iter()
            .filter(|(_, r)| r.counter <= acked)
            .map(|(id, _)| id.clone())
            .collect();

        let mut safe = BTreeMap::new();
        for id in &retired {
            if let Some(record) = self.sent.remove(id) {
                for (app, max) in record.apps {
                    let entry = safe.entry(app).or_insert(max);
                    *entry = (*entry).max(max);
                }
            }
        }
        (retired, safe)
    }

    /// Note that `counter` from the peer has been applied.
    pub fn record_received(&mut self, bundle_id: &str, counter: u64) {
        let newer = self.ack.as_ref().map_or(true, |a| counter >= a.counter);
        if newer {
            self.ack = Some(AckRecord {
                bundle_id: bundle_id.to_string(),
                counter,
            });
        }
        self.largest_received = Some(self.largest_received.map_or(counter, |c| c.max(counter)));
    }

    /// Whether `fingerprint` matches the last minted bundle.
    pub fn is_retransmission(&self, fingerprint: &[u8; 32]) -> Option<&LastSent> {
        self.last_sent
            .as_ref()
            .filter(|last| last.fingerprint == hex::encode(fingerprint))
    }
}

#[derive(Clone)]
pub struct LedgerStore {
    root: PathBuf,
}

impl LedgerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn load(&self, peer: &PeerId) -> Recovery<PeerLedger> {
        load_json(&self.path(peer), PeerLedger::default)
    }

    pub fn save(&self, peer: &PeerId, ledger: &PeerLedger) -> anyhow::Result<()> {
        write_json_atomic(&self.path(peer), ledger)
    }

    fn path(&self, peer: &PeerId) -> PathBuf {
        self.root.join(format!("{peer}.json"))
    }
}
