//! Bundle exchange protocol over TCP.
//!
//! `listener` accepts calls and dispatches them to an `ExchangeHandler`;
//! `client` makes calls with short or long deadlines. Framing lives in
//! `bundle_core::wire`; `codec` reads and writes frames on async streams.

pub mod client;
pub mod codec;
pub mod listener;

use std::path::{Path, PathBuf};

use bundle_core::recency::SignedRecencyBlob;
use bundle_core::wire::{BundleSender, DownloadRequest, InventoryRequest, InventoryResponse};

pub use client::{ExchangeClient, UploadOptions};
pub use listener::ExchangeListener;

/// What a node does with exchange calls. Methods block on file I/O; the
/// listener runs them off the async runtime.
pub trait ExchangeHandler: Send + Sync + 'static {
    /// Final path for an upload. Chunks are staged beside it and renamed
    /// into place only once the caller signals completion.
    fn upload_path(&self, sender: &BundleSender, bundle_id: &str) -> anyhow::Result<PathBuf>;

    /// Runs only for uploads that reached explicit completion.
    fn upload_complete(&self, sender: &BundleSender, bundle_id: &str, path: &Path) -> anyhow::Result<()>;

    fn crash_report(&self, sender: &BundleSender, report: &[u8]) -> anyhow::Result<()> {
        tracing::debug!(sender = %sender, bytes = report.len(), "crash report ignored");
        Ok(())
    }

    /// Bytes to stream back, or `None` for NOT_FOUND.
    fn download(&self, request: &DownloadRequest) -> anyhow::Result<Option<Vec<u8>>>;

    fn inventory(&self, request: &InventoryRequest) -> anyhow::Result<InventoryResponse>;

    fn recency(&self) -> anyhow::Result<Option<SignedRecencyBlob>>;
}
