//! Bundle transmission integration test harness.
//!
//! Every test builds its own server, clients and transports under a
//! temporary directory and talks to them over loopback TCP. Nothing is
//! shared between tests, so they run in parallel.
//!
//!   cargo test --test integration

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use bundle_core::config::{ClientConfig, ExchangeConfig, ServerConfig, TransportConfig};
use bundle_core::crypto::Identity;
use bundle_services::{
    ChannelConsumer, ClientNode, ConsumerEvent, ExchangeClient, ExchangeListener, NullConsumer, ServerNode,
    TransportNode,
};

mod end_to_end;
mod inventory;
mod recovery;
mod relay;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A running server plus the means to attach clients and transports.
pub struct Net {
    pub tmp: TempDir,
    pub server_identity: Arc<Identity>,
    pub server: ServerNode,
    pub server_addr: String,
    /// Consumer notifications from the server engine.
    pub events: mpsc::UnboundedReceiver<ConsumerEvent>,
    pub shutdown: broadcast::Sender<()>,
}

pub fn exchange_config() -> ExchangeConfig {
    ExchangeConfig {
        chunk_size: 512,
        short_deadline_secs: 5,
        long_deadline_secs: 10,
    }
}

impl Net {
    pub async fn start() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let server_identity = Arc::new(Identity::generate());
        let (consumer, events) = ChannelConsumer::new();
        let server = ServerNode::open(&server_config(&tmp), server_identity.clone(), Arc::new(consumer))?;

        let (shutdown, _) = broadcast::channel(1);
        let listener = ExchangeListener::bind(
            "127.0.0.1:0",
            Arc::new(server.clone()),
            exchange_config().chunk_size,
            shutdown.subscribe(),
        )
        .await?;
        let server_addr = listener.local_addr()?.to_string();
        tokio::spawn(listener.run());

        Ok(Self {
            tmp,
            server_identity,
            server,
            server_addr,
            events,
            shutdown,
        })
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    /// Open (or reopen) the client whose state lives under `name`.
    pub fn client(&self, name: &str, identity: &Arc<Identity>) -> Result<ClientNode> {
        let config = ClientConfig {
            data_dir: self.dir(name),
            server_identity: self.server_identity.public().to_hex(),
            app_ids: vec!["mail".into(), "echo".into()],
            ..ClientConfig::default()
        };
        ClientNode::open(&config, identity.clone(), Arc::new(NullConsumer))
    }

    /// Start a transport that serves clients on loopback. Returns the node
    /// and the address clients should dial.
    pub async fn transport(&self, id: &str) -> Result<(TransportNode, String)> {
        let config = TransportConfig {
            id: id.into(),
            data_dir: self.dir(id),
            listen_addr: "127.0.0.1:0".into(),
            server_addr: self.server_addr.clone(),
        };
        let node = TransportNode::open(&config)?;
        let listener = ExchangeListener::bind(
            &config.listen_addr,
            Arc::new(node.clone()),
            exchange_config().chunk_size,
            self.shutdown.subscribe(),
        )
        .await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(listener.run());
        Ok((node, addr))
    }

    pub fn exchange(&self, addr: &str) -> ExchangeClient {
        ExchangeClient::new(addr, &exchange_config())
    }

    pub fn to_server(&self) -> ExchangeClient {
        self.exchange(&self.server_addr)
    }

    /// Drain consumer notifications received so far.
    pub fn drain_events(&mut self) -> Vec<ConsumerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn server_config(tmp: &TempDir) -> ServerConfig {
    ServerConfig {
        data_dir: tmp.path().join("server"),
        app_ids: vec!["mail".into(), "echo".into()],
        ..ServerConfig::default()
    }
}

/// ADU payloads in a list of consumer events, in order.
pub fn delivered(events: &[ConsumerEvent]) -> Vec<(String, u64, Vec<u8>)> {
    events
        .iter()
        .filter_map(|e| match e {
            ConsumerEvent::Adu {
                app_id, adu_id, data, ..
            } => Some((app_id.clone(), *adu_id, data.clone())),
            ConsumerEvent::BatchComplete => None,
        })
        .collect()
}
