//! Exchange client — one TCP connection per call.
//!
//! Uploads and downloads run under the long deadline, inventory and
//! recency under the short one. A deadline miss is an error; the caller
//! decides whether to retry.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use bundle_core::config::ExchangeConfig;
use bundle_core::recency::SignedRecencyBlob;
use bundle_core::wire::{
    BundleSender, DownloadRequest, DownloadStatus, FrameKind, InventoryRequest, InventoryResponse,
    RecencyResponse, UploadStatus, WireError,
};

use super::codec::{decode, expect_frame, next_frame, write_frame, write_json};

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Sent ahead of the chunks and handled independently of the bundle.
    pub crash_report: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExchangeClient {
    addr: String,
    chunk_size: usize,
    short_deadline: Duration,
    long_deadline: Duration,
}

impl ExchangeClient {
    pub fn new(addr: impl Into<String>, config: &ExchangeConfig) -> Self {
        Self {
            addr: addr.into(),
            chunk_size: config.chunk_size.max(1),
            short_deadline: Duration::from_secs(config.short_deadline_secs),
            long_deadline: Duration::from_secs(config.long_deadline_secs),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn upload(&self, sender: &BundleSender, bundle_id: &str, bytes: &[u8]) -> Result<UploadStatus> {
        self.upload_with(sender, bundle_id, bytes, &UploadOptions::default())
            .await
    }

    pub async fn upload_with(
        &self,
        sender: &BundleSender,
        bundle_id: &str,
        bytes: &[u8],
        options: &UploadOptions,
    ) -> Result<UploadStatus> {
        let call = async {
            let mut stream = self.connect().await?;
            write_json(&mut stream, FrameKind::SenderRole, sender).await?;
            write_frame(&mut stream, FrameKind::BundleIdentifier, bundle_id.as_bytes()).await?;
            if let Some(report) = &options.crash_report {
                write_frame(&mut stream, FrameKind::CrashReport, report).await?;
            }
            for chunk in bytes.chunks(self.chunk_size) {
                write_frame(&mut stream, FrameKind::Chunk, chunk).await?;
            }
            write_frame(&mut stream, FrameKind::UploadComplete, &[]).await?;
            stream.flush().await?;

            let body = expect_frame(&mut stream, FrameKind::UploadStatus, "upload status").await?;
            Ok::<_, anyhow::Error>(decode::<UploadStatus>("upload status", &body)?)
        };
        let status = self.deadline(self.long_deadline, "upload", call).await?;
        tracing::debug!(sender = %sender, bundle_id, bytes = bytes.len(), ?status, "upload finished");
        Ok(status)
    }

    /// `None` when the far side has no such bundle for this sender.
    pub async fn download(&self, sender: &BundleSender, bundle_id: &str) -> Result<Option<Vec<u8>>> {
        let request = DownloadRequest {
            sender: sender.clone(),
            bundle_id: bundle_id.to_string(),
        };
        let call = async {
            let mut stream = self.connect().await?;
            write_json(&mut stream, FrameKind::DownloadRequest, &request).await?;
            stream.flush().await?;

            let body = expect_frame(&mut stream, FrameKind::DownloadStatus, "download status").await?;
            if decode::<DownloadStatus>("download status", &body)? == DownloadStatus::NotFound {
                return Ok(None);
            }
            let mut data = Vec::new();
            loop {
                let (kind, body) = next_frame(&mut stream).await?;
                match kind {
                    FrameKind::Chunk => data.extend_from_slice(&body),
                    FrameKind::DownloadComplete => break,
                    other => {
                        return Err(WireError::Unexpected {
                            expected: "chunk",
                            got: other,
                        }
                        .into())
                    }
                }
            }
            Ok::<_, anyhow::Error>(Some(data))
        };
        self.deadline(self.long_deadline, "download", call).await
    }

    pub async fn inventory(&self, request: &InventoryRequest) -> Result<InventoryResponse> {
        let call = async {
            let mut stream = self.connect().await?;
            write_json(&mut stream, FrameKind::InventoryRequest, request).await?;
            stream.flush().await?;
            let body = expect_frame(&mut stream, FrameKind::InventoryResponse, "inventory response").await?;
            Ok::<_, anyhow::Error>(decode("inventory response", &body)?)
        };
        self.deadline(self.short_deadline, "inventory", call).await
    }

    pub async fn recency(&self) -> Result<Option<SignedRecencyBlob>> {
        let call = async {
            let mut stream = self.connect().await?;
            write_frame(&mut stream, FrameKind::RecencyRequest, &[]).await?;
            stream.flush().await?;
            let body = expect_frame(&mut stream, FrameKind::RecencyResponse, "recency response").await?;
            Ok::<_, anyhow::Error>(decode::<RecencyResponse>("recency response", &body)?.blob)
        };
        self.deadline(self.short_deadline, "recency", call).await
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn deadline<T>(
        &self,
        limit: Duration,
        call: &'static str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.with_context(|| format!("{call} call to {} failed", self.addr)),
            Err(_) => bail!("{call} call to {} timed out after {}s", self.addr, limit.as_secs()),
        }
    }
}
