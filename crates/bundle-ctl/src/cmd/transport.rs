//! Transport role commands: serve clients, relay with the server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use bundle_core::config::BundleConfig;
use bundle_services::{ExchangeClient, ExchangeListener, TransportNode};

/// Time between relay rounds while serving.
const RELAY_INTERVAL: Duration = Duration::from_secs(30);

fn load_config() -> BundleConfig {
    BundleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BundleConfig::default()
    })
}

/// Accept client calls and relay with the server on an interval until
/// interrupted.
pub async fn cmd_serve() -> Result<()> {
    let config = load_config();
    let node = TransportNode::open(&config.transport)?;
    let server = ExchangeClient::new(config.transport.server_addr.clone(), &config.exchange);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let listener = ExchangeListener::bind(
        &config.transport.listen_addr,
        Arc::new(node.clone()),
        config.exchange.chunk_size,
        shutdown_tx.subscribe(),
    )
    .await?;
    println!("Serving clients on {}", listener.local_addr()?);
    let listener_task = tokio::spawn(listener.run());

    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(RELAY_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                if let Err(e) = node.relay_with_server(&server).await {
                    tracing::warn!(server = server.addr(), error = %format!("{e:#}"), "relay round failed");
                }
            }
        }
    }
    listener_task.await??;
    Ok(())
}

/// One relay round with the server.
pub async fn cmd_relay(json: bool) -> Result<()> {
    let config = load_config();
    let node = TransportNode::open(&config.transport)?;
    let server = ExchangeClient::new(config.transport.server_addr.clone(), &config.exchange);

    let report = node.relay_with_server(&server).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("═══════════════════════════════════════");
    println!("  Relay with {}", server.addr());
    println!("═══════════════════════════════════════");
    println!("  Deleted    : {}", report.deleted);
    println!("  Uploaded   : {} ({} failed)", report.uploaded, report.upload_failures);
    println!("  Downloaded : {}", report.downloaded);
    println!("  Recency    : {}", if report.recency_refreshed { "refreshed" } else { "unchanged" });
    Ok(())
}
