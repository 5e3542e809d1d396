//! Routing table and received-upload ledger, both server side.
//!
//! `RoutingTable` remembers which transport last delivered a bundle from
//! each client, so an inventory call from a transport only concerns the
//! clients it actually carries for. `ReceivedLedger` remembers which
//! upload names have already been processed, so a transport is told to
//! delete them rather than upload them again.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use bundle_core::crypto::PeerId;
use bundle_core::recovery::{load_json, Recovery};

use crate::persist::write_json_atomic;

/// Processed upload names kept before the oldest are forgotten.
pub const RECEIVED_LEDGER_CAPACITY: usize = 4096;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Routes {
    /// client → transport id
    clients: BTreeMap<PeerId, String>,
}

#[derive(Clone)]
pub struct RoutingTable {
    inner: Arc<Mutex<Routes>>,
    path: Arc<PathBuf>,
}

impl RoutingTable {
    pub fn open(path: PathBuf) -> Self {
        let routes = match load_json(&path, Routes::default) {
            Recovery::Loaded(r) => r,
            Recovery::Recovered { value, reason } => {
                tracing::warn!(reason = %reason, "routing table unreadable, starting empty");
                value
            }
            Recovery::Fatal(e) => {
                tracing::warn!(error = %format!("{:#}", anyhow::Error::new(e)), "failed to read routing table, starting empty");
                Routes::default()
            }
        };
        Self {
            inner: Arc::new(Mutex::new(routes)),
            path: Arc::new(path),
        }
    }

    /// Record that `client` was last reached through `transport`.
    pub fn record(&self, client: &PeerId, transport: &str) {
        let mut routes = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.clients.get(client).map(String::as_str) == Some(transport) {
            return;
        }
        routes.clients.insert(client.clone(), transport.to_string());
        tracing::debug!(client = %client, transport, "route updated");
        if let Err(e) = write_json_atomic(&self.path, &*routes) {
            tracing::warn!(error = %e, "failed to persist routing table");
        }
    }

    /// Clients whose last bundle came through `transport`.
    pub fn clients_of(&self, transport: &str) -> Vec<PeerId> {
        let routes = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        routes
            .clients
            .iter()
            .filter(|(_, t)| t.as_str() == transport)
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn transport_of(&self, client: &PeerId) -> Option<String> {
        let routes = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        routes.clients.get(client).cloned()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Received {
    order: VecDeque<String>,
    #[serde(skip)]
    index: BTreeSet<String>,
}

/// Bounded set of processed upload names, oldest evicted first.
#[derive(Clone)]
pub struct ReceivedLedger {
    inner: Arc<Mutex<Received>>,
    path: Arc<PathBuf>,
    capacity: usize,
}

impl ReceivedLedger {
    pub fn open(path: PathBuf) -> Self {
        Self::with_capacity(path, RECEIVED_LEDGER_CAPACITY)
    }

    pub fn with_capacity(path: PathBuf, capacity: usize) -> Self {
        let mut received = match load_json(&path, Received::default) {
            Recovery::Loaded(r) => r,
            Recovery::Recovered { value, reason } => {
                tracing::warn!(reason = %reason, "received ledger unreadable, starting empty");
                value
            }
            Recovery::Fatal(e) => {
                tracing::warn!(error = %format!("{:#}", anyhow::Error::new(e)), "failed to read received ledger, starting empty");
                Received::default()
            }
        };
        received.index = received.order.iter().cloned().collect();
        Self {
            inner: Arc::new(Mutex::new(received)),
            path: Arc::new(path),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, name: &str) {
        let mut received = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !received.index.insert(name.to_string()) {
            return;
        }
        received.order.push_back(name.to_string());
        while received.order.len() > self.capacity {
            if let Some(old) = received.order.pop_front() {
                received.index.remove(&old);
            }
        }
        if let Err(e) = write_json_atomic(&self.path, &*received) {
            tracing::warn!(error = %e, "failed to persist received ledger");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        let received = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        received.index.contains(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
