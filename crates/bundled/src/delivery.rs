//! Delivery tracking — counts ADUs handed to the consuming application.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use bundle_core::crypto::PeerId;
use bundle_services::ConsumerEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppDeliveries {
    pub adus: u64,
    pub bytes: u64,
    pub last_adu_id: u64,
}

/// Per (client, app) delivery counters.
#[derive(Clone, Default)]
pub struct DeliveryTracker {
    deliveries: Arc<DashMap<(PeerId, String), AppDeliveries>>,
    batches: Arc<AtomicU64>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: &PeerId, app_id: &str, adu_id: u64, len: usize) {
        let mut entry = self
            .deliveries
            .entry((peer.clone(), app_id.to_string()))
            .or_default();
        entry.adus += 1;
        entry.bytes += len as u64;
        entry.last_adu_id = entry.last_adu_id.max(adu_id);
    }

    pub fn batch_complete(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(dead_code)]
    pub fn get(&self, peer: &PeerId, app_id: &str) -> Option<AppDeliveries> {
        self.deliveries
            .get(&(peer.clone(), app_id.to_string()))
            .map(|d| *d)
    }

    pub fn print_stats(&self) {
        if self.deliveries.is_empty() {
            return;
        }
        tracing::info!(
            streams = self.deliveries.len(),
            batches = self.batches.load(Ordering::Relaxed),
            "delivery tracker stats"
        );
        for entry in self.deliveries.iter() {
            let (peer, app_id) = entry.key();
            let d = entry.value();
            tracing::debug!(
                peer = %peer,
                app_id = %app_id,
                adus = d.adus,
                bytes = d.bytes,
                last_adu_id = d.last_adu_id,
                "  deliveries"
            );
        }
    }

    /// Drain consumer events until the channel closes or shutdown.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ConsumerEvent>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,

                event = events.recv() => match event {
                    Some(ConsumerEvent::Adu { peer, app_id, adu_id, data }) => {
                        tracing::debug!(peer = %peer, app_id = %app_id, adu_id, len = data.len(), "ADU delivered");
                        self.record(&peer, &app_id, adu_id, data.len());
                    }
                    Some(ConsumerEvent::BatchComplete) => self.batch_complete(),
                    None => return,
                },
            }
        }
    }
}
