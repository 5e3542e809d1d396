//! Transport node — carries bundles between clients and the server
//! without being able to read them.
//!
//! Clients upload into `from_client/` and download from `from_server/`.
//! When the transport reaches the server it asks for an inventory and
//! does what it is told: delete, upload, download, then refresh the
//! cached recency blob that it hands to clients.
//!
//! Layout under the transport data dir:
//!   from_client/  bundles waiting to go up
//!   from_server/  bundles waiting to be picked up
//!   recency.json  last blob fetched from the server

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use serde::Serialize;

use bundle_core::config::TransportConfig;
use bundle_core::recency::SignedRecencyBlob;
use bundle_core::recovery::{load_json, Recovery};
use bundle_core::wire::{
    is_valid_bundle_id, BundleSender, DownloadRequest, InventoryRequest, InventoryResponse, UploadStatus,
};

use crate::exchange::{ExchangeClient, ExchangeHandler};
use crate::persist::{remove_if_exists, write_atomic, write_json_atomic};

/// What one relay round with the server achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub deleted: usize,
    pub uploaded: usize,
    pub upload_failures: usize,
    pub downloaded: usize,
    pub recency_refreshed: bool,
}

#[derive(Clone)]
pub struct TransportNode {
    sender: BundleSender,
    from_client: PathBuf,
    from_server: PathBuf,
    recency_path: PathBuf,
    recency: Arc<Mutex<Option<SignedRecencyBlob>>>,
}

impl TransportNode {
    pub fn open(config: &TransportConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.id.is_empty(), "transport.id is not configured");
        let root = &config.data_dir;
        let from_client = root.join("from_client");
        let from_server = root.join("from_server");
        for dir in [&from_client, &from_server] {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let recency_path = root.join("recency.json");
        let cached = match load_json(&recency_path, || None::<SignedRecencyBlob>) {
            Recovery::Loaded(blob) => blob,
            Recovery::Recovered { value, reason } => {
                tracing::warn!(reason = %reason, "cached recency blob unreadable, dropping it");
                value
            }
            Recovery::Fatal(e) => return Err(e).context("recency cache"),
        };

        tracing::info!(root = %root.display(), id = %config.id, "transport node ready");
        Ok(Self {
            sender: BundleSender::Transport(config.id.clone()),
            from_client,
            from_server,
            recency_path,
            recency: Arc::new(Mutex::new(cached)),
        })
    }

    pub fn sender(&self) -> &BundleSender {
        &self.sender
    }

    /// Bundle ids waiting to go to the server.
    pub fn client_bundles(&self) -> anyhow::Result<Vec<String>> {
        held_ids(&self.from_client)
    }

    /// Bundle ids waiting for clients.
    pub fn server_bundles(&self) -> anyhow::Result<Vec<String>> {
        held_ids(&self.from_server)
    }

    pub fn cached_recency(&self) -> Option<SignedRecencyBlob> {
        self.recency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One round with the server: inventory, delete, upload, download,
    /// recency. Individual transfer failures are counted and logged; only
    /// a failed inventory aborts the round.
    pub async fn relay_with_server(&self, server: &ExchangeClient) -> anyhow::Result<RelayReport> {
        let request = InventoryRequest {
            sender: Some(self.sender.clone()),
            bundle_ids_from_clients_on_transport: self.client_bundles()?,
            bundle_ids_from_server_on_transport: self.server_bundles()?,
        };
        let inventory = server.inventory(&request).await.context("inventory")?;
        let mut report = RelayReport::default();

        for bundle_id in &inventory.to_delete {
            if !is_valid_bundle_id(bundle_id) {
                tracing::warn!(bundle_id = %bundle_id, "server named an invalid bundle id");
                continue;
            }
            for dir in [&self.from_client, &self.from_server] {
                if remove_if_exists(&dir.join(bundle_id))? {
                    report.deleted += 1;
                }
            }
        }

        for bundle_id in &inventory.to_upload {
            if !is_valid_bundle_id(bundle_id) {
                continue;
            }
            let path = self.from_client.join(bundle_id);
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
            };
            match server.upload(&self.sender, bundle_id, &bytes).await {
                Ok(UploadStatus::Success) => {
                    remove_if_exists(&path)?;
                    report.uploaded += 1;
                }
                Ok(UploadStatus::Failed) => {
                    tracing::warn!(bundle_id = %bundle_id, "server refused upload, keeping it");
                    report.upload_failures += 1;
                }
                Err(e) => {
                    tracing::warn!(bundle_id = %bundle_id, error = %format!("{e:#}"), "upload failed");
                    report.upload_failures += 1;
                }
            }
        }

        for bundle_id in &inventory.to_download {
            if !is_valid_bundle_id(bundle_id) {
                continue;
            }
            match server.download(&self.sender, bundle_id).await {
                Ok(Some(data)) => {
                    write_atomic(&self.from_server.join(bundle_id), &data)?;
                    report.downloaded += 1;
                }
                Ok(None) => tracing::debug!(bundle_id = %bundle_id, "bundle no longer current"),
                Err(e) => tracing::warn!(bundle_id = %bundle_id, error = %format!("{e:#}"), "download failed"),
            }
        }

        match server.recency().await {
            Ok(Some(blob)) => {
                write_json_atomic(&self.recency_path, &Some(&blob))?;
                *self.recency.lock().unwrap_or_else(PoisonError::into_inner) = Some(blob);
                report.recency_refreshed = true;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "recency refresh failed"),
        }

        tracing::info!(
            deleted = report.deleted,
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            "relay round finished"
        );
        Ok(report)
    }
}

impl ExchangeHandler for TransportNode {
    fn upload_path(&self, sender: &BundleSender, bundle_id: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            matches!(sender, BundleSender::Client(_)),
            "transport accepts uploads from clients only"
        );
        Ok(self.from_client.join(bundle_id))
    }

    fn upload_complete(&self, sender: &BundleSender, bundle_id: &str, _path: &Path) -> anyhow::Result<()> {
        tracing::info!(sender = %sender, bundle_id, "client bundle held for the server");
        Ok(())
    }

    fn download(&self, request: &DownloadRequest) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.from_server.join(&request.bundle_id);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn inventory(&self, _request: &InventoryRequest) -> anyhow::Result<InventoryResponse> {
        anyhow::bail!("inventory is answered by the server, not a transport")
    }

    fn recency(&self) -> anyhow::Result<Option<SignedRecencyBlob>> {
        Ok(self.cached_recency())
    }
}

/// Complete bundles in `dir`, sorted. Staged `.part` files are skipped.
fn held_ids(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_valid_bundle_id(name) {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}
