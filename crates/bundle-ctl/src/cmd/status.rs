//! Server status, peers, violations, ADU, and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_bytes, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    id: String,
    exchange_addr: String,
    uptime_secs: u64,
    peers_known: usize,
    violations: usize,
    clients: Vec<ClientStatus>,
}

#[derive(Deserialize)]
struct ClientStatus {
    peer: String,
    send_window: [u64; 2],
    next_counter: u64,
    recv_window: [u64; 2],
    unacknowledged: usize,
    largest_received: Option<u64>,
}

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
struct PeerInfo {
    id: String,
    first_seen: u64,
    last_seen: u64,
    transport: Option<String>,
}

#[derive(Deserialize)]
struct ViolationsResponse {
    violations: Vec<ViolationInfo>,
}

#[derive(Deserialize)]
struct ViolationInfo {
    at: u64,
    kind: String,
    peer: String,
    bundle_id: String,
    detail: String,
}

#[derive(Deserialize)]
struct AdusResponse {
    last_delivered_id: u64,
    adus: Vec<AduInfo>,
}

#[derive(Deserialize)]
struct AduInfo {
    adu_id: u64,
    size: usize,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Bundle Server Status");
    println!("═══════════════════════════════════════");
    println!("  Server id   : {}", resp.id);
    println!("  Exchange    : {}", resp.exchange_addr);
    println!("  Uptime      : {}s", resp.uptime_secs);
    println!("  Peers known : {}", resp.peers_known);
    println!("  Violations  : {}", resp.violations);

    if resp.clients.is_empty() {
        println!("\n  No clients yet.");
    } else {
        println!("\n  Clients:");
        for c in &resp.clients {
            println!("  ┌─ {}", c.peer);
            println!(
                "  │  send window : [{}, {})  next {}",
                c.send_window[0], c.send_window[1], c.next_counter
            );
            println!("  │  recv window : [{}, {})", c.recv_window[0], c.recv_window[1]);
            println!(
                "  │  largest rx  : {}",
                c.largest_received.map_or("-".to_string(), |n| n.to_string())
            );
            println!("  └─ unacked     : {}", c.unacknowledged);
        }
    }

    Ok(())
}

pub async fn cmd_peers(port: u16) -> Result<()> {
    let resp: PeersResponse = get_json(&format!("{}/peers", base_url(port))).await?;

    if resp.peers.is_empty() {
        println!("No clients known yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Known Clients ({})", resp.peers.len());
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        println!("  ┌─ {}", p.id);
        println!("  │  first seen : {}", p.first_seen);
        println!("  │  last seen  : {}", p.last_seen);
        println!("  └─ transport  : {}", p.transport.as_deref().unwrap_or("direct"));
    }

    Ok(())
}

pub async fn cmd_violations(port: u16) -> Result<()> {
    let resp: ViolationsResponse = get_json(&format!("{}/violations", base_url(port))).await?;

    if resp.violations.is_empty() {
        println!("No protocol violations recorded.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Recent Violations ({})", resp.violations.len());
    println!("═══════════════════════════════════════");

    for v in &resp.violations {
        let short = &v.bundle_id[..v.bundle_id.len().min(16)];
        println!("  ┌─ {} at {}", v.kind, v.at);
        println!("  │  peer   : {}", v.peer);
        println!("  │  bundle : {}", short);
        println!("  └─ detail : {}", v.detail);
    }

    Ok(())
}

pub async fn cmd_adus(port: u16, peer: &str, app: &str) -> Result<()> {
    let resp: AdusResponse = get_json(&format!("{}/adus/{}/{}", base_url(port), peer, app)).await?;

    println!("  Last delivered : {}", resp.last_delivered_id);
    if resp.adus.is_empty() {
        println!("  No ADUs held.");
    }
    for a in &resp.adus {
        println!("  {:>6}  {} bytes", a.adu_id, a.size);
    }
    Ok(())
}

pub async fn cmd_enqueue(port: u16, peer: &str, app: &str, file: &str) -> Result<()> {
    #[derive(Deserialize)]
    struct EnqueueResponse {
        adu_id: u64,
    }

    let data = tokio::fs::read(file).await?;
    let resp: EnqueueResponse = post_bytes(&format!("{}/adus/{}/{}", base_url(port), peer, app), data).await?;
    println!("Queued ADU {} for {} ({}).", resp.adu_id, peer, app);
    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
