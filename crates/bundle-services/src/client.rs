//! Client node — one device talking to exactly one server.
//!
//! Applications hand data to `send`; `sync` carries the current bundle up
//! and pulls down whatever the server has minted inside the receive
//! window. Received ADUs stay in the inbox until the consuming
//! application deletes them.
//!
//! Layout under the client data dir:
//!   engine/      transmission engine state
//!   downloads/   bundles fetched but not yet processed

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use serde::Serialize;

use bundle_core::config::ClientConfig;
use bundle_core::crypto::{Identity, PeerIdentity};
use bundle_core::recency::{unix_now, RecencyBlob, RecencyTracker, SignedRecencyBlob};
use bundle_core::session::Direction;
use bundle_core::wire::{BundleSender, UploadStatus};

use crate::adu_store::{AduDirection, StoredAdu};
use crate::consumer::AduConsumer;
use crate::engine::{EngineSettings, OutboundBundle, Receipt, ReceiveOutcome, TransmissionEngine};
use crate::exchange::ExchangeClient;

/// What one `sync` achieved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub bundle_id: String,
    pub retransmission: bool,
    /// `None` when the upload call itself failed.
    pub upload: Option<UploadStatus>,
    pub downloaded: usize,
    pub applied: usize,
    pub new_adus: usize,
    pub stale: usize,
    pub invalid: usize,
    pub rejected: usize,
}

impl SyncReport {
    fn tally(&mut self, receipts: &[Receipt]) {
        for receipt in receipts {
            match &receipt.outcome {
                ReceiveOutcome::Applied { new_adus, .. } => {
                    self.applied += 1;
                    self.new_adus += new_adus;
                }
                ReceiveOutcome::Stale { .. } => self.stale += 1,
                ReceiveOutcome::Invalid { .. } => self.invalid += 1,
                ReceiveOutcome::Rejected { .. } => self.rejected += 1,
            }
        }
    }
}

#[derive(Clone)]
pub struct ClientNode {
    engine: TransmissionEngine,
    server: PeerIdentity,
    sender: BundleSender,
    downloads: PathBuf,
    recency: Arc<Mutex<RecencyTracker>>,
}

impl ClientNode {
    pub fn open(
        config: &ClientConfig,
        identity: Arc<Identity>,
        consumer: Arc<dyn AduConsumer>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.server_identity.is_empty(),
            "client.server_identity is not configured"
        );
        let server = PeerIdentity::from_hex(&config.server_identity).context("client.server_identity")?;
        Self::open_with_server(config, identity, server, consumer)
    }

    pub fn open_with_server(
        config: &ClientConfig,
        identity: Arc<Identity>,
        server: PeerIdentity,
        consumer: Arc<dyn AduConsumer>,
    ) -> anyhow::Result<Self> {
        let root = &config.data_dir;
        let settings = EngineSettings {
            outbound: Direction::Upstream,
            window_length: config.window_length,
            payload_budget: config.payload_budget_bytes,
            app_ids: config.app_ids.clone(),
            accept_only: Some(server),
        };
        let sender = BundleSender::Client(identity.id().to_string());
        let engine = TransmissionEngine::open(&root.join("engine"), identity, settings, consumer)?;
        let downloads = root.join("downloads");
        std::fs::create_dir_all(&downloads)
            .with_context(|| format!("failed to create {}", downloads.display()))?;
        tracing::info!(root = %root.display(), server = %server.id(), "client node ready");
        Ok(Self {
            engine,
            server,
            sender,
            downloads,
            recency: Arc::new(Mutex::new(RecencyTracker::new(server))),
        })
    }

    pub fn engine(&self) -> &TransmissionEngine {
        &self.engine
    }

    pub fn server(&self) -> &PeerIdentity {
        &self.server
    }

    /// How this client names itself on exchange calls.
    pub fn sender(&self) -> &BundleSender {
        &self.sender
    }

    /// Queue data for the server; returns the ADU id.
    pub fn send(&self, app_id: &str, data: &[u8]) -> anyhow::Result<u64> {
        self.engine.submit(&self.server.id(), app_id, data)
    }

    /// The bundle to upload next, minted or reused.
    pub fn generate(&self) -> anyhow::Result<OutboundBundle> {
        self.engine.generate(&self.server)
    }

    /// Ids of the server bundles this client can accept next.
    pub fn window_ids(&self) -> anyhow::Result<Vec<String>> {
        self.engine.expected_ids(&self.server)
    }

    /// Process downloaded bundle files; each is removed once handled.
    pub fn process(&self, files: &[PathBuf]) -> Vec<Receipt> {
        self.engine.process_batch(files)
    }

    /// Upload the current bundle, then download and process every server
    /// bundle in the receive window.
    pub async fn sync(&self, exchange: &ExchangeClient) -> anyhow::Result<SyncReport> {
        let node = self.clone();
        let bundle = tokio::task::spawn_blocking(move || node.generate())
            .await
            .context("bundle generation panicked")??;
        let bytes = tokio::fs::read(&bundle.path)
            .await
            .with_context(|| format!("failed to read {}", bundle.path.display()))?;

        let mut report = SyncReport {
            bundle_id: bundle.bundle_id.clone(),
            retransmission: bundle.retransmission,
            ..SyncReport::default()
        };
        match exchange.upload(&self.sender, &bundle.bundle_id, &bytes).await {
            Ok(status) => report.upload = Some(status),
            Err(e) => tracing::warn!(
                bundle_id = %bundle.bundle_id,
                addr = exchange.addr(),
                error = %format!("{e:#}"),
                "upload failed"
            ),
        }

        let mut files = Vec::new();
        for bundle_id in self.window_ids()? {
            match exchange.download(&self.sender, &bundle_id).await {
                Ok(Some(data)) => {
                    let path = self.downloads.join(&bundle_id);
                    tokio::fs::write(&path, &data)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    files.push(path);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(bundle_id = %bundle_id, error = %format!("{e:#}"), "download failed");
                    break;
                }
            }
        }
        report.downloaded = files.len();

        let node = self.clone();
        let receipts = tokio::task::spawn_blocking(move || node.process(&files))
            .await
            .context("bundle processing panicked")?;
        report.tally(&receipts);

        tracing::info!(
            bundle_id = %report.bundle_id,
            upload = ?report.upload,
            downloaded = report.downloaded,
            applied = report.applied,
            new_adus = report.new_adus,
            "sync finished"
        );
        Ok(report)
    }

    // ── Inbox ────────────────────────────────────────────────────────────────

    /// Applications with received data.
    pub fn inbox_apps(&self) -> Vec<String> {
        self.engine.adus().apps(&self.server.id(), AduDirection::Recv)
    }

    /// Received ADUs for `app_id` still held, oldest first.
    pub fn inbox(&self, app_id: &str) -> anyhow::Result<Vec<StoredAdu>> {
        let adus = self
            .engine
            .adus()
            .list_from(&self.server.id(), app_id, AduDirection::Recv, 1)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(adus)
    }

    /// Consumer acknowledgement: ADUs up to `adu_id` are delivered and gone.
    pub fn delete_inbox(&self, app_id: &str, adu_id: u64) -> anyhow::Result<usize> {
        let adus = self.engine.adus();
        let server = self.server.id();
        adus.mark_progress(&server, app_id, AduDirection::Recv, adu_id)?;
        Ok(adus.delete_up_to(&server, app_id, AduDirection::Recv, adu_id)?)
    }

    // ── Recency ──────────────────────────────────────────────────────────────

    /// Verify a blob relayed by `transport_id`. Returns true when it is
    /// the newest seen from that transport.
    pub fn observe_recency(&self, transport_id: &str, blob: &SignedRecencyBlob) -> anyhow::Result<bool> {
        let mut tracker = self.recency.lock().unwrap_or_else(PoisonError::into_inner);
        let newer = tracker
            .observe(transport_id, blob, unix_now())
            .with_context(|| format!("recency blob from {transport_id}"))?;
        if newer {
            tracing::debug!(transport = transport_id, timestamp = blob.blob.timestamp, "recency updated");
        }
        Ok(newer)
    }

    /// Ask `exchange` for its cached recency blob and record it.
    pub async fn fetch_recency(&self, transport_id: &str, exchange: &ExchangeClient) -> anyhow::Result<bool> {
        match exchange.recency().await? {
            Some(blob) => self.observe_recency(transport_id, &blob),
            None => Ok(false),
        }
    }

    pub fn newest_recency(&self, transport_id: &str) -> Option<RecencyBlob> {
        let tracker = self.recency.lock().unwrap_or_else(PoisonError::into_inner);
        tracker.newest(transport_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::NullConsumer;
    use crate::exchange::{ExchangeHandler, ExchangeListener};
    use crate::server::ServerNode;
    use bundle_core::config::{ExchangeConfig, ServerConfig};

    struct Pair {
        _tmp: tempfile::TempDir,
        server: ServerNode,
        server_identity: Arc<Identity>,
        client: ClientNode,
    }

    fn pair() -> Pair {
        let tmp = tempfile::tempdir().unwrap();
        let server_identity = Arc::new(Identity::generate());
        let server = ServerNode::open(
            &ServerConfig {
                data_dir: tmp.path().join("server"),
                ..ServerConfig::default()
            },
            server_identity.clone(),
            Arc::new(NullConsumer),
        )
        .unwrap();
        let client = ClientNode::open(
            &ClientConfig {
                data_dir: tmp.path().join("client"),
                server_identity: server_identity.public().to_hex(),
                ..ClientConfig::default()
            },
            Arc::new(Identity::generate()),
            Arc::new(NullConsumer),
        )
        .unwrap();
        Pair {
            _tmp: tmp,
            server,
            server_identity,
            client,
        }
    }

    #[test]
    fn missing_server_identity_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            data_dir: tmp.path().to_path_buf(),
            ..ClientConfig::default()
        };
        assert!(ClientNode::open(&config, Arc::new(Identity::generate()), Arc::new(NullConsumer)).is_err());
    }

    #[test]
    fn inbox_holds_received_until_deleted() {
        let p = pair();
        // Introduce the client with a heartbeat.
        let hello = p.client.generate().unwrap();
        let staged = p.server.upload_path(p.client.sender(), &hello.bundle_id).unwrap();
        std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
        std::fs::copy(&hello.path, &staged).unwrap();
        p.server.upload_complete(p.client.sender(), &hello.bundle_id, &staged).unwrap();

        let client_id = p.client.engine().local().id();
        p.server.send_to(&client_id, "mail", b"one").unwrap();
        p.server.send_to(&client_id, "mail", b"two").unwrap();
        let down = p.server.generate_for(&client_id).unwrap().unwrap();
        assert_eq!(p.client.window_ids().unwrap()[0], down.bundle_id);

        let fetched = p.client.downloads.join(&down.bundle_id);
        std::fs::copy(&down.path, &fetched).unwrap();
        let receipts = p.client.process(&[fetched]);
        assert!(matches!(receipts[0].outcome, ReceiveOutcome::Applied { new_adus: 2, .. }));

        assert_eq!(p.client.inbox_apps(), vec!["mail".to_string()]);
        let inbox = p.client.inbox("mail").unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(&inbox[1].data[..], b"two");

        assert_eq!(p.client.delete_inbox("mail", 1).unwrap(), 1);
        let inbox = p.client.inbox("mail").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].adu_id, 2);
    }

    #[test]
    fn recency_must_come_from_the_server() {
        let p = pair();
        let genuine = SignedRecencyBlob::sign(&p.server_identity, unix_now());
        assert!(p.client.observe_recency("t1", &genuine).unwrap());
        assert_eq!(p.client.newest_recency("t1").unwrap().timestamp, genuine.blob.timestamp);

        let forged = SignedRecencyBlob::sign(&Identity::generate(), unix_now() + 1);
        assert!(p.client.observe_recency("t1", &forged).is_err());
        assert_eq!(p.client.newest_recency("t1").unwrap().timestamp, genuine.blob.timestamp);
    }

    #[tokio::test]
    async fn sync_over_loopback_delivers_both_ways() {
        let p = pair();
        let (_shutdown, rx) = tokio::sync::broadcast::channel(1);
        let listener = ExchangeListener::bind("127.0.0.1:0", Arc::new(p.server.clone()), 1024, rx)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(listener.run());
        let exchange = ExchangeClient::new(addr, &ExchangeConfig::default());

        p.client.send("mail", b"up").unwrap();
        let first = p.client.sync(&exchange).await.unwrap();
        assert_eq!(first.upload, Some(UploadStatus::Success));
        // The server has nothing for a client it just met.
        assert_eq!(first.applied, 1);
        assert_eq!(first.new_adus, 0);

        let client_id = p.client.engine().local().id();
        p.server.send_to(&client_id, "mail", b"down").unwrap();
        let second = p.client.sync(&exchange).await.unwrap();
        assert_eq!(second.new_adus, 1);
        assert_eq!(&p.client.inbox("mail").unwrap()[0].data[..], b"down");
    }
}
