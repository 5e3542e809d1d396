//! Exchange wire format — framing for upload, download, inventory and
//! recency calls.
//!
//! One TCP connection carries one call. Every message on it is a frame:
//!
//!   [FrameHeader 8 bytes] [body: `length` bytes]
//!
//! Chunk and crash-report bodies are raw bytes; everything else is JSON.
//! The first frame a caller sends selects the call:
//!
//!   Upload     SenderRole, BundleIdentifier, [CrashReport], Chunk*, UploadComplete
//!              ← UploadStatus
//!   Download   DownloadRequest
//!              ← DownloadStatus, Chunk*, DownloadComplete
//!   Inventory  InventoryRequest ← InventoryResponse
//!   Recency    RecencyRequest   ← RecencyResponse
//!
//! Either side may answer with an Error frame and close.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::recency::SignedRecencyBlob;

/// First byte of every frame.
pub const FRAME_MAGIC: u8 = 0xB7;

/// Largest frame body accepted. Chunks are sized well under this.
pub const MAX_FRAME_BODY: usize = 8 * 1024 * 1024;

/// Longest bundle identifier accepted on the wire.
pub const MAX_BUNDLE_ID_LEN: usize = 256;

// ── Frame header ──────────────────────────────────────────────────────────────

/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub magic: u8,
    /// `FrameKind` discriminant.
    pub kind: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    pub reserved: u8,
    /// Body length in bytes, not including this header.
    pub length: U32<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 8]);

impl FrameHeader {
    pub const SIZE: usize = 8;

    pub fn new(kind: FrameKind, length: usize) -> Result<Self, WireError> {
        if length > MAX_FRAME_BODY {
            return Err(WireError::TooLarge(length));
        }
        Ok(Self {
            magic: FRAME_MAGIC,
            kind: kind as u8,
            flags: 0,
            reserved: 0,
            length: U32::new(length as u32),
        })
    }

    /// Validate a received header; returns its kind and body length.
    pub fn parse(bytes: &[u8; Self::SIZE]) -> Result<(FrameKind, usize), WireError> {
        let header = Self::read_from(&bytes[..]).ok_or(WireError::Truncated)?;
        if header.magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(header.magic));
        }
        let kind = FrameKind::try_from(header.kind)?;
        let length = header.length.get() as usize;
        if length > MAX_FRAME_BODY {
            return Err(WireError::TooLarge(length));
        }
        Ok((kind, length))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    SenderRole = 0x01,
    BundleIdentifier = 0x02,
    Chunk = 0x03,
    CrashReport = 0x04,
    UploadComplete = 0x05,
    UploadStatus = 0x06,
    DownloadRequest = 0x10,
    DownloadStatus = 0x11,
    DownloadComplete = 0x12,
    InventoryRequest = 0x20,
    InventoryResponse = 0x21,
    RecencyRequest = 0x30,
    RecencyResponse = 0x31,
    Error = 0x7F,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0x01 => Self::SenderRole,
            0x02 => Self::BundleIdentifier,
            0x03 => Self::Chunk,
            0x04 => Self::CrashReport,
            0x05 => Self::UploadComplete,
            0x06 => Self::UploadStatus,
            0x10 => Self::DownloadRequest,
            0x11 => Self::DownloadStatus,
            0x12 => Self::DownloadComplete,
            0x20 => Self::InventoryRequest,
            0x21 => Self::InventoryResponse,
            0x30 => Self::RecencyRequest,
            0x31 => Self::RecencyResponse,
            0x7F => Self::Error,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

// ── Sender role ───────────────────────────────────────────────────────────────

/// Role of the party on the other end of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SenderKind {
    Client,
    Transport,
    Server,
}

/// Who is calling. Selects storage roots and inventory rules, never
/// authorization: that comes from the bundle signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "SenderRole", try_from = "SenderRole")]
pub enum BundleSender {
    Client(String),
    Transport(String),
    Server(String),
}

/// `SenderRole{type, id}` as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderRole {
    #[serde(rename = "type")]
    pub kind: SenderKind,
    pub id: String,
}

impl BundleSender {
    pub fn kind(&self) -> SenderKind {
        match self {
            BundleSender::Client(_) => SenderKind::Client,
            BundleSender::Transport(_) => SenderKind::Transport,
            BundleSender::Server(_) => SenderKind::Server,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BundleSender::Client(id) | BundleSender::Transport(id) | BundleSender::Server(id) => id,
        }
    }
}

impl From<BundleSender> for SenderRole {
    fn from(sender: BundleSender) -> Self {
        let kind = sender.kind();
        let id = match sender {
            BundleSender::Client(id) | BundleSender::Transport(id) | BundleSender::Server(id) => id,
        };
        SenderRole { kind, id }
    }
}

impl TryFrom<SenderRole> for BundleSender {
    type Error = WireError;

    fn try_from(role: SenderRole) -> Result<Self, WireError> {
        if !is_valid_sender_id(&role.id) {
            return Err(WireError::BadSender(role.id));
        }
        Ok(match role.kind {
            SenderKind::Client => BundleSender::Client(role.id),
            SenderKind::Transport => BundleSender::Transport(role.id),
            SenderKind::Server => BundleSender::Server(role.id),
        })
    }
}

impl std::fmt::Display for BundleSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.kind(), self.id())
    }
}

/// Sender ids name staging directories on the server. An id made only of
/// dots would resolve to a parent directory.
pub fn is_valid_sender_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.bytes().all(|b| b == b'.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

/// Bundle ids double as file names at every hop.
pub fn is_valid_bundle_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_BUNDLE_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

// ── Message bodies ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub sender: BundleSender,
    pub bundle_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Found,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRequest {
    pub sender: Option<BundleSender>,
    pub bundle_ids_from_clients_on_transport: Vec<String>,
    pub bundle_ids_from_server_on_transport: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryResponse {
    pub to_delete: Vec<String>,
    pub to_download: Vec<String>,
    pub to_upload: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecencyResponse {
    pub blob: Option<SignedRecencyBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("bad frame magic 0x{0:02x}")]
    BadMagic(u8),

    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("frame body of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("invalid sender id {0:?}")]
    BadSender(String),

    #[error("expected {expected:?} frame, got {got:?}")]
    Unexpected { expected: &'static str, got: FrameKind },

    #[error("malformed {0} body: {1}")]
    BadBody(&'static str, String),

    #[error("peer reported error: {0}")]
    Remote(String),
}
