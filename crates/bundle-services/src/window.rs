//! Sliding window manager.
//!
//! Each peer has two windows:
//! - `send`: counters this side mints for outbound bundles. `begin` moves
//!   when the peer acknowledges; minting stops once `length` bundles are
//!   outstanding.
//! - `recv`: counters this side will accept from the peer. `begin` moves
//!   past every counter that has been applied.
//!
//! Both are persisted in `{root}/{peer}.json` before `advance` returns.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use bundle_core::config::DEFAULT_WINDOW_LENGTH;
use bundle_core::crypto::PeerId;
use bundle_core::recovery::{load_json, Recovery};

use crate::persist::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    /// Below the window: already applied. Ignore.
    Stale,
    Expected,
    /// Beyond the window: the peer minted more than it may have in flight.
    Invalid,
}

/// `[begin, begin + length)` plus the next counter to mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindow {
    pub begin: u64,
    pub length: u64,
    /// Send side only: the next counter `mint` hands out.
    #[serde(default)]
    pub next: u64,
}

impl SlidingWindow {
    pub fn new(length: u64) -> Self {
        Self {
            begin: 0,
            length: length.max(1),
            next: 0,
        }
    }

    /// Last counter inside the window.
    pub fn end(&self) -> u64 {
        self.begin.saturating_add(self.length.saturating_sub(1))
    }

    pub fn classify(&self, counter: u64) -> Classification {
        if counter < self.begin {
            Classification::Stale
        } else if counter > self.end() {
            Classification::Invalid
        } else {
            Classification::Expected
        }
    }

    /// Retire every counter `<= acked`. Returns false if nothing moved.
    pub fn advance(&mut self, acked: u64) -> bool {
        if acked < self.begin {
            return false;
        }
        self.begin = acked.saturating_add(1);
        self.next = self.next.max(self.begin);
        true
    }

    /// Next counter to mint, or `None` if `length` bundles are unacknowledged.
    pub fn mint(&mut self) -> Option<u64> {
        if self.next > self.end() {
            return None;
        }
        let counter = self.next;
        self.next += 1;
        Some(counter)
    }

    /// Counters the window currently admits, low to high.
    pub fn counters(&self) -> std::ops::RangeInclusive<u64> {
        self.begin..=self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerWindows {
    pub send: SlidingWindow,
    pub recv: SlidingWindow,
}

impl PeerWindows {
    pub fn new(length: u64) -> Self {
        Self {
            send: SlidingWindow::new(length),
            recv: SlidingWindow::new(length),
        }
    }
}

impl Default for PeerWindows {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_LENGTH)
    }
}

/// Loads and persists [`PeerWindows`]. Holds no in-memory cache: callers
/// hold the engine's per-peer lock across load, mutate, and save.
#[derive(Clone)]
pub struct WindowStore {
    root: PathBuf,
    length: u64,
}

impl WindowStore {
    pub fn new(root: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            root: root.into(),
            length,
        }
    }

    pub fn load(&self, peer: &PeerId) -> Recovery<PeerWindows> {
        let length = self.length;
        load_json(&self.path(peer), || PeerWindows::new(length))
    }

    pub fn save(&self, peer: &PeerId, windows: &PeerWindows) -> anyhow::Result<()> {
        write_json_atomic(&self.path(peer), windows)
    }

    fn path(&self, peer: &PeerId) -> PathBuf {
        self.root.join(format!("{peer}.json"))
    }
}
