//! Client role commands: identity, queueing, sync, inbox.

use std::sync::Arc;

use anyhow::{Context, Result};

use bundle_core::config::BundleConfig;
use bundle_core::crypto::{Identity, PeerIdentity};
use bundle_services::{ClientNode, ExchangeClient, NullConsumer};

fn load_config() -> BundleConfig {
    if let Err(e) = BundleConfig::write_default_if_missing() {
        eprintln!("warning: failed to write default config: {e}");
    }
    BundleConfig::load().unwrap_or_else(|e| {
        eprintln!("warning: failed to load config, using defaults: {e}");
        BundleConfig::default()
    })
}

fn load_identity(config: &BundleConfig) -> Result<Arc<Identity>> {
    let path = &config.identity.key_path;
    let identity =
        Identity::load_or_generate(path).with_context(|| format!("failed to load identity from {}", path.display()))?;
    Ok(Arc::new(identity))
}

fn open_node() -> Result<ClientNode> {
    let config = load_config();
    let identity = load_identity(&config)?;
    ClientNode::open(&config.client, identity, Arc::new(NullConsumer))
}

/// Create the identity and, if given, pin the server's public identity.
pub fn cmd_init(server_identity: Option<&str>) -> Result<()> {
    let mut config = load_config();
    let identity = load_identity(&config)?;

    if let Some(hex) = server_identity {
        let server = PeerIdentity::from_hex(hex).context("server identity must be 128 hex characters")?;
        config.client.server_identity = server.to_hex();
        let path = config.save()?;
        println!("Server pinned : {} (saved to {})", server.id(), path.display());
    }
    println!("Client id     : {}", identity.id());
    println!("Public ident. : {}", identity.public().to_hex());
    Ok(())
}

pub fn cmd_identity() -> Result<()> {
    let config = load_config();
    let identity = load_identity(&config)?;
    println!("{}", identity.public().to_hex());
    Ok(())
}

pub fn cmd_send(app: &str, file: &str) -> Result<()> {
    let node = open_node()?;
    let data = std::fs::read(file).with_context(|| format!("failed to read {file}"))?;
    let adu_id = node.send(app, &data)?;
    println!("Queued ADU {} for {} ({} bytes). Run `sync` to carry it.", adu_id, app, data.len());
    Ok(())
}

pub async fn cmd_sync(addr: &str, json: bool) -> Result<()> {
    let config = load_config();
    let identity = load_identity(&config)?;
    let node = ClientNode::open(&config.client, identity, Arc::new(NullConsumer))?;
    let exchange = ExchangeClient::new(addr, &config.exchange);

    let report = node.sync(&exchange).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("═══════════════════════════════════════");
    println!("  Sync with {}", addr);
    println!("═══════════════════════════════════════");
    println!(
        "  Uploaded   : {}{}",
        &report.bundle_id[..report.bundle_id.len().min(16)],
        if report.retransmission { " (retransmission)" } else { "" }
    );
    println!(
        "  Status     : {}",
        report.upload.map_or("unreachable".to_string(), |s| format!("{s:?}"))
    );
    println!("  Downloaded : {}", report.downloaded);
    println!("  Applied    : {} ({} new ADUs)", report.applied, report.new_adus);
    if report.stale + report.invalid + report.rejected > 0 {
        println!(
            "  Dropped    : {} stale, {} invalid, {} rejected",
            report.stale, report.invalid, report.rejected
        );
    }

    match node.fetch_recency(addr, &exchange).await {
        Ok(true) => {
            if let Some(blob) = node.newest_recency(addr) {
                println!("  Recency    : server seen at {}", blob.timestamp);
            }
        }
        Ok(false) => {}
        Err(e) => println!("  Recency    : rejected ({e:#})"),
    }
    Ok(())
}

pub fn cmd_inbox(app: Option<&str>) -> Result<()> {
    let node = open_node()?;
    let apps = match app {
        Some(app) => vec![app.to_string()],
        None => node.inbox_apps(),
    };
    if apps.is_empty() {
        println!("Inbox is empty.");
        return Ok(());
    }
    for app in apps {
        let adus = node.inbox(&app)?;
        println!("  ┌─ {} ({} held)", app, adus.len());
        for adu in &adus {
            let preview = String::from_utf8_lossy(&adu.data[..adu.data.len().min(48)]).replace('\n', " ");
            println!("  │  {:>6}  {:>8} bytes  {}", adu.adu_id, adu.data.len(), preview);
        }
        println!("  └─");
    }
    Ok(())
}

pub fn cmd_inbox_delete(app: &str, up_to: &str) -> Result<()> {
    let up_to: u64 = up_to.parse().context("ADU id must be a number")?;
    let node = open_node()?;
    let removed = node.delete_inbox(app, up_to)?;
    println!("Removed {} ADUs from {} (through {}).", removed, app, up_to);
    Ok(())
}
