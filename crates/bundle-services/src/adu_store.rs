//! ADU store — durable per-(peer, app, direction) sequences of opaque
//! application payloads.
//!
//! Layout:
//!   {root}/{peer}/{send|recv}/{app}/metadata.json
//!   {root}/{peer}/{send|recv}/{app}/{adu_id}.adu
//!
//! Ids start at 1 and grow by one per append. Metadata read-modify-write
//! happens under a per-key mutex, so concurrent appends and deletes on the
//! same key cannot lose updates. Different keys never contend.

use std::fs;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use bundle_core::crypto::PeerId;
use bundle_core::payload::is_valid_app_id;
use bundle_core::recovery::{load_json, Recovery};

use crate::locks::{hold, KeyedLocks};
use crate::persist::{remove_if_exists, write_json_atomic};

/// Which side of the exchange an ADU sequence belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AduDirection {
    /// Produced locally, waiting to be carried to the peer.
    Send,
    /// Received from the peer, waiting for the consuming application.
    Recv,
}

impl AduDirection {
    fn dir_name(self) -> &'static str {
        match self {
            AduDirection::Send => "send",
            AduDirection::Recv => "recv",
        }
    }
}

/// Bookkeeping for one key. All fields start at 0 ("nothing yet").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AduMetadata {
    pub last_added_id: u64,
    /// Outbound: highest id placed in a minted bundle.
    pub last_sent_id: u64,
    /// Inbound: highest id handed to the consumer.
    pub last_delivered_id: u64,
    pub last_deleted_id: u64,
}

#[derive(Debug, Error)]
pub enum AduError {
    #[error("ADU {app_id}/{adu_id} not found")]
    NotFound { app_id: String, adu_id: u64 },

    #[error("invalid application id {0:?}")]
    InvalidAppId(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

type StoreKey = (PeerId, String, AduDirection);

#[derive(Clone)]
pub struct AduStore {
    root: PathBuf,
    locks: KeyedLocks<StoreKey>,
}

impl AduStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| anyhow::anyhow!("failed to create ADU root {}: {e}", root.display()))?;
        Ok(Self {
            root,
            locks: KeyedLocks::new(),
        })
    }

    /// Append outbound bytes; returns the assigned id.
    pub fn append(&self, peer: &PeerId, app_id: &str, data: &[u8]) -> Result<u64, AduError> {
        let dir = self.key_dir(peer, app_id, AduDirection::Send)?;
        let lock = self.locks.handle(&key(peer, app_id, AduDirection::Send));
        let _guard = hold(&lock);

        let mut meta = self.load_meta(&dir)?;
        let adu_id = meta.last_added_id + 1;
        crate::persist::write_atomic(&dir.join(adu_file(adu_id)), data)?;
        meta.last_added_id = adu_id;
        write_json_atomic(&dir.join("metadata.json"), &meta)?;

        tracing::debug!(peer = %peer, app_id, adu_id, len = data.len(), "ADU appended");
        Ok(adu_id)
    }

    /// Store an ADU under a caller-chosen id. Returns false without
    /// touching anything if `adu_id` is not beyond the last added id.
    pub fn put(
        &self,
        peer: &PeerId,
        app_id: &str,
        direction: AduDirection,
        adu_id: u64,
        data: &[u8],
    ) -> Result<bool, AduError> {
        let dir = self.key_dir(peer, app_id, direction)?;
        let lock = self.locks.handle(&key(peer, app_id, direction));
        let _guard = hold(&lock);

        let mut meta = self.load_meta(&dir)?;
        if adu_id <= meta.last_added_id {
            tracing::trace!(peer = %peer, app_id, adu_id, "duplicate ADU ignored");
            return Ok(false);
        }
        if adu_id > meta.last_added_id + 1 {
            tracing::warn!(
                peer = %peer,
                app_id,
                adu_id,
                last_added = meta.last_added_id,
                "gap in ADU sequence"
            );
        }
        crate::persist::write_atomic(&dir.join(adu_file(adu_id)), data)?;
        meta.last_added_id = adu_id;
        write_json_atomic(&dir.join("metadata.json"), &meta)?;
        Ok(true)
    }

    pub fn read(
        &self,
        peer: &PeerId,
        app_id: &str,
        direction: AduDirection,
        adu_id: u64,
    ) -> Result<Bytes, AduError> {
        let path = self.key_dir(peer, app_id, direction)?.join(adu_file(adu_id));
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AduError::NotFound {
                app_id: app_id.to_string(),
                adu_id,
            }),
            Err(e) => Err(AduError::Io(
                anyhow::Error::new(e).context(format!("failed to read {}", path.display())),
            )),
        }
    }

    /// Lazy, ordered iteration over stored ADUs with id >= `start_id`.
    ///
    /// The upper bound is fixed when the iterator is created, so the
    /// sequence is finite even while appends continue. Calling again with
    /// the same `start_id` restarts it.
    pub fn list_from(
        &self,
        peer: &PeerId,
        app_id: &str,
        direction: AduDirection,
        start_id: u64,
    ) -> Result<AduIter, AduError> {
        let dir = self.key_dir(peer, app_id, direction)?;
        let meta = self.metadata(peer, app_id, direction)?;
        let first = start_id.max(meta.last_deleted_id + 1).max(1);
        Ok(AduIter {
            dir,
            app_id: app_id.to_string(),
            next: first,
            last: meta.last_added_id,
        })
    }

    /// Delete every ADU with id <= `adu_id`. Deleting an already-deleted
    /// range is a no-op. Returns how many files were removed.
    pub fn delete_up_to(
        &self,
        peer: &PeerId,
        app_id: &str,
        direction: AduDirection,
        adu_id: u64,
    ) -> Result<usize, AduError> {
        let dir = self.key_dir(peer, app_id, direction)?;
        let lock = self.locks.handle(&key(peer, app_id, direction));
        let _guard = hold(&lock);

        let mut meta = self.load_meta(&dir)?;
        let target = adu_id.min(meta.last_added_id);
        if target <= meta.last_deleted_id {
            return Ok(0);
        }

        let mut removed = 0;
        for id in meta.last_deleted_id + 1..=target {
            if remove_if_exists(&dir.join(adu_file(id)))? {
                removed += 1;
            }
        }
        meta.last_deleted_id = target;
        write_json_atomic(&dir.join("metadata.json"), &meta)?;

        tracing::debug!(peer = %peer, app_id, ?direction, up_to = target, removed, "ADUs deleted");
        Ok(removed)
    }

    /// Raise `last_sent_id` (outbound) or `last_delivered_id` (inbound).
    /// Never regresses and never passes `last_added_id`.
    pub fn mark_progress(
        &self,
        peer: &PeerId,
        app_id: &str,
        direction: AduDirection,
        adu_id: u64,
    ) -> Result<(), AduError> {
        let dir = self.key_dir(peer, app_id, direction)?;
        let lock = self.locks.handle(&key(peer, app_id, direction));
        let _guard = hold(&lock);

        let mut meta = self.load_meta(&dir)?;
        let capped = adu_id.min(meta.last_added_id);
        let field = match direction {
            AduDirection::Send => &mut meta.last_sent_id,
            AduDirection::Recv => &mut meta.last_delivered_id,
        };
        if capped <= *field {
            return Ok(());
        }
        *field = capped;
        write_json_atomic(&dir.join("metadata.json"), &meta)?;
        Ok(())
    }

    /// Current metadata. A missing record reads as all zeros.
    pub fn metadata(
        &self,
        peer: &PeerId,
        app_id: &str,
        direction: AduDirection,
    ) -> Result<AduMetadata, AduError> {
        let dir = self.key_dir(peer, app_id, direction)?;
        let lock = self.locks.handle(&key(peer, app_id, direction));
        let _guard = hold(&lock);
        self.load_meta(&dir)
    }

    /// Applications with any stored state for this peer and direction.
    pub fn apps(&self, peer: &PeerId, direction: AduDirection) -> Vec<String> {
        let dir = self.root.join(peer.as_str()).join(direction.dir_name());
        let mut apps: Vec<String> = fs::read_dir(dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| is_valid_app_id(name))
            .collect();
        apps.sort();
        apps
    }

    fn key_dir(&self, peer: &PeerId, app_id: &str, direction: AduDirection) -> Result<PathBuf, AduError> {
        if !is_valid_app_id(app_id) {
            return Err(AduError::InvalidAppId(app_id.to_string()));
        }
        Ok(self
            .root
            .join(peer.as_str())
            .join(direction.dir_name())
            .join(app_id))
    }

    /// Caller holds the key's lock.
    fn load_meta(&self, dir: &std::path::Path) -> Result<AduMetadata, AduError> {
        match load_json(&dir.join("metadata.json"), AduMetadata::default) {
            Recovery::Loaded(meta) => Ok(meta),
            Recovery::Recovered { reason, .. } => {
                let meta = rebuild_metadata(dir);
                tracing::warn!(
                    dir = %dir.display(),
                    reason = %reason,
                    last_added = meta.last_added_id,
                    last_deleted = meta.last_deleted_id,
                    "ADU metadata unreadable, rebuilt from files"
                );
                write_json_atomic(&dir.join("metadata.json"), &meta)?;
                Ok(meta)
            }
            Recovery::Fatal(e) => Err(AduError::Io(e.into())),
        }
    }
}

/// Derive metadata from the ADU files present. Progress markers are set
/// to the conservative value: nothing sent or delivered past what's gone.
fn rebuild_metadata(dir: &std::path::Path) -> AduMetadata {
    let ids: Vec<u64> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            name.strip_suffix(".adu")?.parse().ok()
        })
        .collect();
    let (Some(&min), Some(&max)) = (ids.iter().min(), ids.iter().max()) else {
        return AduMetadata::default();
    };
    AduMetadata {
        last_added_id: max,
        last_sent_id: min - 1,
        last_delivered_id: min - 1,
        last_deleted_id: min - 1,
    }
}

fn key(peer: &PeerId, app_id: &str, direction: AduDirection) -> StoreKey {
    (peer.clone(), app_id.to_string(), direction)
}

fn adu_file(adu_id: u64) -> String {
    format!("{adu_id}.adu")
}

/// Iterator returned by [`AduStore::list_from`].
///
/// Ids whose file has vanished (deleted concurrently) are skipped.
pub struct AduIter {
    dir: PathBuf,
    app_id: String,
    next: u64,
    last: u64,
}

/// One stored ADU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAdu {
    pub app_id: String,
    pub adu_id: u64,
    pub data: Bytes,
}

impl Iterator for AduIter {
    type Item = Result<StoredAdu, AduError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next <= self.last {
            let adu_id = self.next;
            self.next += 1;
            let path = self.dir.join(adu_file(adu_id));
            match fs::read(&path) {
                Ok(data) => {
                    return Some(Ok(StoredAdu {
                        app_id: self.app_id.clone(),
                        adu_id,
                        data: Bytes::from(data),
                    }))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Some(Err(AduError::Io(
                        anyhow::Error::new(e).context(format!("failed to read {}", path.display())),
                    )))
                }
            }
        }
        None
    }
}
