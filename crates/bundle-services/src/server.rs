//! Server node — the backend end of every client's bundle stream.
//!
//! Wraps the transmission engine with what only a server needs: learning
//! clients from their first authenticated bundle, remembering which
//! transport carries for which client, answering inventory calls, serving
//! downloads, signing recency blobs, and keeping crash reports.
//!
//! Layout under the server data dir:
//!   engine/         transmission engine state
//!   inbound/        staged uploads, per sender role
//!   crash_reports/  opaque crash blobs, verbatim
//!   peers.json  routes.json  received.json

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use bundle_core::config::ServerConfig;
use bundle_core::crypto::{Identity, PeerId};
use bundle_core::recency::{unix_now, SignedRecencyBlob};
use bundle_core::session::Direction;
use bundle_core::wire::{is_valid_sender_id, BundleSender, DownloadRequest, InventoryRequest, InventoryResponse};

use crate::consumer::AduConsumer;
use crate::engine::{
    BundleFault, EngineSettings, OutboundBundle, Receipt, ReceiveOutcome, TransmissionEngine,
};
use crate::exchange::ExchangeHandler;
use crate::peers::PeerDirectory;
use crate::persist::write_atomic;
use crate::routing::{ReceivedLedger, RoutingTable};
use crate::sender::{DownloadSource, SenderPolicy};

#[derive(Clone)]
pub struct ServerNode {
    engine: TransmissionEngine,
    identity: Arc<Identity>,
    peers: PeerDirectory,
    routes: RoutingTable,
    received: ReceivedLedger,
    inbound_root: PathBuf,
    crash_dir: PathBuf,
}

impl ServerNode {
    pub fn open(
        config: &ServerConfig,
        identity: Arc<Identity>,
        consumer: Arc<dyn AduConsumer>,
    ) -> anyhow::Result<Self> {
        let root = &config.data_dir;
        let settings = EngineSettings {
            outbound: Direction::Downstream,
            window_length: config.window_length,
            payload_budget: config.payload_budget_bytes,
            app_ids: config.app_ids.clone(),
            accept_only: None,
        };
        let engine = TransmissionEngine::open(&root.join("engine"), identity.clone(), settings, consumer)?;
        let inbound_root = root.join("inbound");
        let crash_dir = root.join("crash_reports");
        for dir in [&inbound_root, &crash_dir] {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        tracing::info!(root = %root.display(), id = %identity.id(), "server node ready");
        Ok(Self {
            engine,
            peers: PeerDirectory::with_persistence(root.join("peers.json")),
            routes: RoutingTable::open(root.join("routes.json")),
            received: ReceivedLedger::open(root.join("received.json")),
            identity,
            inbound_root,
            crash_dir,
        })
    }

    pub fn engine(&self) -> &TransmissionEngine {
        &self.engine
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn policy(&self, sender: &BundleSender) -> SenderPolicy {
        SenderPolicy::resolve(sender, &self.inbound_root, &self.routes)
    }

    /// Completion hook for a fully uploaded bundle.
    ///
    /// Processes the staged file, learns the sender, records the route
    /// when it arrived through a transport, and remembers the upload name.
    pub fn process_received(&self, name: &str, path: &Path, sender: &BundleSender) -> Receipt {
        let policy = self.policy(sender);
        let receipt = self
            .engine
            .process_batch(&[path.to_path_buf()])
            .into_iter()
            .next()
            .unwrap_or(Receipt {
                bundle_id: None,
                peer: None,
                outcome: ReceiveOutcome::Rejected {
                    fault: BundleFault::TransientIo,
                    reason: "empty batch".into(),
                },
            });

        if let Some(client) = &receipt.peer {
            self.peers.observe(client);
            if let Some(transport) = policy.transport_id() {
                self.routes.record(&client.id(), transport);
            }
        }
        let retry = matches!(
            receipt.outcome,
            ReceiveOutcome::Rejected {
                fault: BundleFault::TransientIo,
                ..
            }
        );
        if !retry {
            self.received.record(name);
        }
        tracing::debug!(name, sender = %sender, outcome = ?receipt.outcome, "upload processed");
        receipt
    }

    /// Current bundle for a known client.
    pub fn generate_for(&self, client: &PeerId) -> anyhow::Result<Option<OutboundBundle>> {
        let Some(identity) = self.peers.get(client) else {
            return Ok(None);
        };
        self.engine.generate(&identity).map(Some)
    }

    /// Queue outbound data for a known client.
    pub fn send_to(&self, client: &PeerId, app_id: &str, data: &[u8]) -> anyhow::Result<u64> {
        anyhow::ensure!(self.peers.contains(client), "unknown client {client}");
        self.engine.submit(client, app_id, data)
    }

    pub fn resolve_download(&self, request: &DownloadRequest) -> anyhow::Result<Option<Vec<u8>>> {
        match self.policy(&request.sender).download {
            DownloadSource::Generate { client } => {
                let Some(bundle) = self.generate_for(&client)? else {
                    return Ok(None);
                };
                if bundle.bundle_id != request.bundle_id {
                    tracing::debug!(
                        client = %client,
                        requested = %request.bundle_id,
                        current = %bundle.bundle_id,
                        "requested bundle is not current"
                    );
                    return Ok(None);
                }
                self.engine.read_outbox(&bundle.bundle_id)
            }
            DownloadSource::Outbox => self.engine.read_outbox(&request.bundle_id),
            DownloadSource::Refuse => Ok(None),
        }
    }

    /// Decide what a transport deletes, downloads, and uploads.
    ///
    /// Client bundles the server already processed are deleted, the rest
    /// are uploaded. The current bundle for every client in scope is
    /// downloaded unless the transport holds it; server bundles on the
    /// transport that are no longer current are deleted.
    pub fn inventory(&self, request: &InventoryRequest) -> anyhow::Result<InventoryResponse> {
        let scope = request
            .sender
            .as_ref()
            .map(|s| self.policy(s).inventory_clients)
            .unwrap_or_default();

        let mut response = InventoryResponse::default();
        for id in &request.bundle_ids_from_clients_on_transport {
            if self.received.contains(id) {
                response.to_delete.push(id.clone());
            } else {
                response.to_upload.push(id.clone());
            }
        }

        let mut current = BTreeSet::new();
        for client in &scope {
            match self.generate_for(client) {
                Ok(Some(bundle)) => {
                    current.insert(bundle.bundle_id);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(client = %client, error = %format!("{e:#}"), "failed to generate bundle"),
            }
        }

        let held: BTreeSet<&String> = request.bundle_ids_from_server_on_transport.iter().collect();
        for id in &request.bundle_ids_from_server_on_transport {
            if !current.contains(id) {
                response.to_delete.push(id.clone());
            }
        }
        response.to_download = current.into_iter().filter(|id| !held.contains(id)).collect();

        tracing::info!(
            sender = ?request.sender,
            delete = response.to_delete.len(),
            download = response.to_download.len(),
            upload = response.to_upload.len(),
            "inventory reconciled"
        );
        Ok(response)
    }

    pub fn recency(&self) -> SignedRecencyBlob {
        SignedRecencyBlob::sign(&self.identity, unix_now())
    }

    pub fn store_crash_report(&self, sender: &BundleSender, report: &[u8]) -> anyhow::Result<PathBuf> {
        let name = format!("{:?}-{}-{}.bin", sender.kind(), sender.id(), unix_now()).to_lowercase();
        let path = self.crash_dir.join(name);
        write_atomic(&path, report)?;
        tracing::info!(sender = %sender, bytes = report.len(), "crash report stored");
        Ok(path)
    }
}

impl ExchangeHandler for ServerNode {
    fn upload_path(&self, sender: &BundleSender, bundle_id: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(is_valid_sender_id(sender.id()), "invalid sender id {:?}", sender.id());
        Ok(self.policy(sender).upload_dir.join(bundle_id))
    }

    fn upload_complete(&self, sender: &BundleSender, bundle_id: &str, path: &Path) -> anyhow::Result<()> {
        let receipt = self.process_received(bundle_id, path, sender);
        match receipt.outcome {
            ReceiveOutcome::Rejected {
                fault: BundleFault::TransientIo,
                reason,
            } => anyhow::bail!("bundle {bundle_id} not processed: {reason}"),
            _ => Ok(()),
        }
    }

    fn crash_report(&self, sender: &BundleSender, report: &[u8]) -> anyhow::Result<()> {
        self.store_crash_report(sender, report).map(|_| ())
    }

    fn download(&self, request: &DownloadRequest) -> anyhow::Result<Option<Vec<u8>>> {
        self.resolve_download(request)
    }

    fn inventory(&self, request: &InventoryRequest) -> anyhow::Result<InventoryResponse> {
        ServerNode::inventory(self, request)
    }

    fn recency(&self) -> anyhow::Result<Option<SignedRecencyBlob>> {
        Ok(Some(ServerNode::recency(self)))
    }
}
