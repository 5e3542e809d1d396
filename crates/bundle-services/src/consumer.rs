//! The consuming-application boundary.
//!
//! The transmission engine calls `on_adu` once for every inbound ADU it
//! stores for the first time, then `on_batch_complete` once per receipt
//! batch. Retransmissions, stale bundles and rejected bundles never reach
//! a consumer.

use bundle_core::crypto::PeerId;
use tokio::sync::mpsc;

pub trait AduConsumer: Send + Sync {
    fn on_adu(&self, peer: &PeerId, app_id: &str, adu_id: u64, data: &[u8]);

    fn on_batch_complete(&self);
}

/// Discards notifications. The ADUs are still in the store.
pub struct NullConsumer;

impl AduConsumer for NullConsumer {
    fn on_adu(&self, _peer: &PeerId, _app_id: &str, _adu_id: u64, _data: &[u8]) {}

    fn on_batch_complete(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Adu {
        peer: PeerId,
        app_id: String,
        adu_id: u64,
        data: Vec<u8>,
    },
    BatchComplete,
}

/// Forwards notifications into a channel for an async consumer task.
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<ConsumerEvent>,
}

impl ChannelConsumer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConsumerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AduConsumer for ChannelConsumer {
    fn on_adu(&self, peer: &PeerId, app_id: &str, adu_id: u64, data: &[u8]) {
        let event = ConsumerEvent::Adu {
            peer: peer.clone(),
            app_id: app_id.to_string(),
            adu_id,
            data: data.to_vec(),
        };
        if self.tx.send(event).is_err() {
            tracing::trace!(app_id, adu_id, "consumer channel closed");
        }
    }

    fn on_batch_complete(&self) {
        let _ = self.tx.send(ConsumerEvent::BatchComplete);
    }
}
