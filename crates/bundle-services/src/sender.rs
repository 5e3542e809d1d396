//! Per-role policy for one exchange call.
//!
//! The sender role picks where an upload is staged, where a download is
//! served from, and which clients an inventory call covers. It is resolved
//! once per call into a `SenderPolicy`; nothing downstream branches on the
//! role again. The role is never an authorization decision.

use std::path::{Path, PathBuf};

use bundle_core::crypto::PeerId;
use bundle_core::wire::BundleSender;

use crate::routing::RoutingTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSource {
    /// A client pulling directly: synthesize its current bundle.
    Generate { client: PeerId },
    /// A transport: serve what was materialized earlier.
    Outbox,
    /// No bundles are ever served to this role.
    Refuse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderPolicy {
    pub sender: BundleSender,
    /// Directory uploads from this sender land in.
    pub upload_dir: PathBuf,
    pub download: DownloadSource,
    /// Clients whose bundles an inventory call from this sender concerns.
    pub inventory_clients: Vec<PeerId>,
}

impl SenderPolicy {
    /// Resolve against the server's inbound root and routing table.
    pub fn resolve(sender: &BundleSender, inbound_root: &Path, routes: &RoutingTable) -> Self {
        match sender {
            BundleSender::Client(id) => {
                let client = PeerId::parse(id);
                Self {
                    sender: sender.clone(),
                    upload_dir: inbound_root.join("client").join(id),
                    download: client
                        .clone()
                        .map_or(DownloadSource::Refuse, |client| DownloadSource::Generate { client }),
                    inventory_clients: client.into_iter().collect(),
                }
            }
            BundleSender::Transport(id) => Self {
                sender: sender.clone(),
                upload_dir: inbound_root.join("transport").join(id),
                download: DownloadSource::Outbox,
                inventory_clients: routes.clients_of(id),
            },
            BundleSender::Server(id) => Self {
                sender: sender.clone(),
                upload_dir: inbound_root.join("server").join(id),
                download: DownloadSource::Refuse,
                inventory_clients: Vec::new(),
            },
        }
    }

    /// Transport id when the sender relays for others.
    pub fn transport_id(&self) -> Option<&str> {
        match &self.sender {
            BundleSender::Transport(id) => Some(id),
            _ => None,
        }
    }
}
