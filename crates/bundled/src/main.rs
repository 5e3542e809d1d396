//! bundled — bundle server daemon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use bundle_core::config::BundleConfig;
use bundle_core::crypto::Identity;
use bundle_services::{ChannelConsumer, ExchangeListener, ServerNode};

mod delivery;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BundleConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BundleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BundleConfig::default()
    });
    tracing::info!(data_dir = %config.server.data_dir.display(), "bundled starting");

    // Identity
    let key_path = &config.identity.key_path;
    let identity = Arc::new(
        Identity::load_or_generate(key_path)
            .with_context(|| format!("failed to load identity from {}", key_path.display()))?,
    );
    tracing::info!(
        id = %identity.id(),
        public_identity = %identity.public().to_hex(),
        "identity ready"
    );

    // Server state
    let (consumer, events) = ChannelConsumer::new();
    let server = ServerNode::open(&config.server, identity, Arc::new(consumer))?;
    let tracker = delivery::DeliveryTracker::new();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener = ExchangeListener::bind(
        &config.server.listen_addr,
        Arc::new(server.clone()),
        config.exchange.chunk_size,
        shutdown_tx.subscribe(),
    )
    .await?;
    let exchange_addr = listener.local_addr()?.to_string();
    let listener_task = tokio::spawn(listener.run());

    let delivery_task = tokio::spawn(tracker.clone().run(events, shutdown_tx.subscribe()));

    let stats_printer = {
        let tracker = tracker.clone();
        let server = server.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                tracing::info!(
                    peers = server.peers().len(),
                    violations = server.engine().violations().len(),
                    "server snapshot"
                );
                tracker.print_stats();
            }
        })
    };

    // Status HTTP endpoint
    let api_port = config.server.api_port;
    let api_task = {
        let state = bundle_api::ApiState {
            server: server.clone(),
            exchange_addr,
            started_at: Instant::now(),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = bundle_api::serve(state, api_port).await {
                tracing::error!(error = %e, "status server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = listener_task        => tracing::error!("exchange listener exited: {:?}", r),
        r = delivery_task        => tracing::error!("delivery tracker exited: {:?}", r),
        r = stats_printer        => tracing::error!("stats printer exited: {:?}", r),
        r = api_task             => tracing::error!("API server exited: {:?}", r),
    }

    Ok(())
}
