//! Protocol violation log for operator visibility.
//!
//! Out-of-window counters, undecodable bundles and similar discards are
//! recorded here as well as logged. In memory only, newest kept.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use bundle_core::recency::unix_now;

pub const VIOLATION_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    OutOfWindow,
    WrongDirection,
    Malformed,
    Authentication,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub at: u64,
    pub kind: ViolationKind,
    /// Peer id when known, otherwise the claimed sender.
    pub peer: String,
    pub bundle_id: String,
    pub detail: String,
}

#[derive(Clone)]
pub struct ViolationLog {
    entries: Arc<Mutex<VecDeque<Violation>>>,
    capacity: usize,
}

impl Default for ViolationLog {
    fn default() -> Self {
        Self::new(VIOLATION_LOG_CAPACITY)
    }
}

impl ViolationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, kind: ViolationKind, peer: &str, bundle_id: &str, detail: impl Into<String>) {
        let violation = Violation {
            at: unix_now(),
            kind,
            peer: peer.to_string(),
            bundle_id: bundle_id.to_string(),
            detail: detail.into(),
        };
        tracing::warn!(
            ?kind,
            peer,
            bundle_id,
            detail = %violation.detail,
            "protocol violation"
        );
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(violation);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<Violation> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
