//! Exchange listener — accepts TCP calls and serves them from a handler.
//!
//! One task per connection; the first frame selects the call. Handler
//! methods do file I/O and run under `spawn_blocking`. Chunks are appended
//! in arrival order to `<final>.part`. The staged file is renamed into
//! place and the completion hook runs only after `UploadComplete`; a call
//! that errors or disconnects first has its partial file removed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use bundle_core::wire::{
    is_valid_bundle_id, BundleSender, DownloadRequest, DownloadStatus, FrameKind, InventoryRequest,
    RecencyResponse, UploadStatus, WireError,
};

use super::codec::{decode, expect_frame, next_frame, read_frame, write_error, write_frame, write_json};
use super::ExchangeHandler;

pub struct ExchangeListener {
    listener: TcpListener,
    handler: Arc<dyn ExchangeHandler>,
    chunk_size: usize,
    shutdown: broadcast::Receiver<()>,
}

impl ExchangeListener {
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn ExchangeHandler>,
        chunk_size: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind exchange listener on {addr}"))?;
        Ok(Self {
            listener,
            handler,
            chunk_size: chunk_size.max(1),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "exchange listener started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("exchange listener shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    let chunk_size = self.chunk_size;
                    tokio::spawn(async move {
                        if let Err(e) = serve_call(stream, handler, chunk_size).await {
                            tracing::warn!(%peer_addr, error = %format!("{e:#}"), "exchange call failed");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_call(mut stream: TcpStream, handler: Arc<dyn ExchangeHandler>, chunk_size: usize) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let Some((kind, body)) = read_frame(&mut reader).await? else {
        return Ok(());
    };

    let result = match kind {
        FrameKind::SenderRole => serve_upload(&body, &mut reader, &mut writer, &handler).await,
        FrameKind::DownloadRequest => serve_download(&body, &mut writer, &handler, chunk_size).await,
        FrameKind::InventoryRequest => serve_inventory(&body, &mut writer, &handler).await,
        FrameKind::RecencyRequest => serve_recency(&mut writer, &handler).await,
        other => Err(WireError::Unexpected {
            expected: "call",
            got: other,
        }
        .into()),
    };

    if let Err(e) = &result {
        // The peer may already be gone.
        let _ = write_error(&mut writer, format!("{e:#}")).await;
    }
    writer.flush().await?;
    result
}

async fn serve_upload<R, W>(
    role: &[u8],
    reader: &mut R,
    writer: &mut W,
    handler: &Arc<dyn ExchangeHandler>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let sender: BundleSender = decode("sender role", role)?;
    let id_body = expect_frame(reader, FrameKind::BundleIdentifier, "bundle identifier").await?;
    let bundle_id = String::from_utf8(id_body)
        .map_err(|_| WireError::BadBody("bundle identifier", "not UTF-8".into()))?;
    if !is_valid_bundle_id(&bundle_id) {
        return Err(WireError::BadBody("bundle identifier", format!("{bundle_id:?}")).into());
    }

    let final_path = blocking(handler, {
        let sender = sender.clone();
        let bundle_id = bundle_id.clone();
        move |h| h.upload_path(&sender, &bundle_id)
    })
    .await?;
    let staged = staging_path(&final_path);

    match receive_chunks(reader, &staged, &sender, handler).await {
        Ok(bytes) => {
            tokio::fs::rename(&staged, &final_path)
                .await
                .with_context(|| format!("failed to move {} into place", staged.display()))?;
            tracing::debug!(sender = %sender, bundle_id = %bundle_id, bytes, "upload received");
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&staged).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %rm, path = %staged.display(), "failed to remove partial upload");
                }
            }
            tracing::warn!(sender = %sender, bundle_id = %bundle_id, error = %format!("{e:#}"), "upload aborted");
            let _ = write_json(writer, FrameKind::UploadStatus, &UploadStatus::Failed).await;
            return Ok(());
        }
    }

    let hook = blocking(handler, {
        let sender = sender.clone();
        let bundle_id = bundle_id.clone();
        let path = final_path.clone();
        move |h| h.upload_complete(&sender, &bundle_id, &path)
    })
    .await;
    let status = match hook {
        Ok(()) => UploadStatus::Success,
        Err(e) => {
            tracing::warn!(sender = %sender, bundle_id = %bundle_id, error = %format!("{e:#}"), "completion hook failed");
            UploadStatus::Failed
        }
    };
    write_json(writer, FrameKind::UploadStatus, &status).await
}

/// Append chunks to `staged` until `UploadComplete`. Returns bytes written.
async fn receive_chunks<R: AsyncRead + Unpin>(
    reader: &mut R,
    staged: &std::path::Path,
    sender: &BundleSender,
    handler: &Arc<dyn ExchangeHandler>,
) -> Result<u64> {
    if let Some(parent) = staged.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file = tokio::fs::File::create(staged)
        .await
        .with_context(|| format!("failed to create {}", staged.display()))?;

    let mut written = 0u64;
    loop {
        let (kind, body) = next_frame(reader).await?;
        match kind {
            FrameKind::Chunk => {
                file.write_all(&body).await?;
                written += body.len() as u64;
                tracing::trace!(len = body.len(), written, "chunk staged");
            }
            FrameKind::CrashReport => {
                let sender = sender.clone();
                blocking(handler, move |h| h.crash_report(&sender, &body)).await?;
            }
            FrameKind::UploadComplete => break,
            other => {
                return Err(WireError::Unexpected {
                    expected: "chunk",
                    got: other,
                }
                .into())
            }
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn serve_download<W: AsyncWrite + Unpin>(
    body: &[u8],
    writer: &mut W,
    handler: &Arc<dyn ExchangeHandler>,
    chunk_size: usize,
) -> Result<()> {
    let request: DownloadRequest = decode("download request", body)?;
    if !is_valid_bundle_id(&request.bundle_id) {
        return Err(WireError::BadBody("download request", format!("{:?}", request.bundle_id)).into());
    }
    let sender = request.sender.clone();
    let bundle_id = request.bundle_id.clone();
    let found = blocking(handler, move |h| h.download(&request)).await?;

    let Some(data) = found else {
        tracing::debug!(sender = %sender, bundle_id = %bundle_id, "download not found");
        return write_json(writer, FrameKind::DownloadStatus, &DownloadStatus::NotFound).await;
    };
    write_json(writer, FrameKind::DownloadStatus, &DownloadStatus::Found).await?;
    for chunk in data.chunks(chunk_size) {
        write_frame(writer, FrameKind::Chunk, chunk).await?;
    }
    write_frame(writer, FrameKind::DownloadComplete, &[]).await?;
    tracing::debug!(sender = %sender, bundle_id = %bundle_id, bytes = data.len(), "download served");
    Ok(())
}

async fn serve_inventory<W: AsyncWrite + Unpin>(
    body: &[u8],
    writer: &mut W,
    handler: &Arc<dyn ExchangeHandler>,
) -> Result<()> {
    let request: InventoryRequest = decode("inventory request", body)?;
    let response = blocking(handler, move |h| h.inventory(&request)).await?;
    write_json(writer, FrameKind::InventoryResponse, &response).await
}

async fn serve_recency<W: AsyncWrite + Unpin>(writer: &mut W, handler: &Arc<dyn ExchangeHandler>) -> Result<()> {
    let blob = blocking(handler, |h| h.recency()).await?;
    write_json(writer, FrameKind::RecencyResponse, &RecencyResponse { blob }).await
}

/// Run a handler method on the blocking pool.
async fn blocking<T, F>(handler: &Arc<dyn ExchangeHandler>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ExchangeHandler) -> Result<T> + Send + 'static,
{
    let handler = handler.clone();
    tokio::task::spawn_blocking(move || f(handler.as_ref()))
        .await
        .context("handler task panicked")?
}

fn staging_path(final_path: &std::path::Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
