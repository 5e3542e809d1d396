//! Frame I/O on async byte streams.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::AsBytes;

use bundle_core::wire::{ErrorBody, FrameHeader, FrameKind, WireError};

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    body: &[u8],
) -> anyhow::Result<()> {
    let header = FrameHeader::new(kind, body.len())?;
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

pub async fn write_json<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    kind: FrameKind,
    value: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(value)?;
    write_frame(writer, kind, &body).await
}

pub async fn write_error<W: AsyncWrite + Unpin>(writer: &mut W, message: impl Into<String>) -> anyhow::Result<()> {
    write_json(
        writer,
        FrameKind::Error,
        &ErrorBody {
            message: message.into(),
        },
    )
    .await?;
    writer.flush().await?;
    Ok(())
}

/// Next frame, or `None` if the stream ended cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<(FrameKind, Vec<u8>)>> {
    let mut header = [0u8; FrameHeader::SIZE];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::Truncated.into());
        }
        filled += n;
    }
    let (kind, length) = FrameHeader::parse(&header)?;
    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| WireError::Truncated)?;
    Ok(Some((kind, body)))
}

/// Next frame, which must exist. A peer `Error` frame becomes `WireError::Remote`.
pub async fn next_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<(FrameKind, Vec<u8>)> {
    let (kind, body) = read_frame(reader).await?.ok_or(WireError::Truncated)?;
    if kind == FrameKind::Error {
        let message = decode::<ErrorBody>("error", &body)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        return Err(WireError::Remote(message).into());
    }
    Ok((kind, body))
}

/// Next frame, which must be `expected`.
pub async fn expect_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: FrameKind,
    name: &'static str,
) -> anyhow::Result<Vec<u8>> {
    let (kind, body) = next_frame(reader).await?;
    if kind != expected {
        return Err(WireError::Unexpected { expected: name, got: kind }.into());
    }
    Ok(body)
}

pub fn decode<T: DeserializeOwned>(name: &'static str, body: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(body).map_err(|e| WireError::BadBody(name, e.to_string()))
}
