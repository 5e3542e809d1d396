//! Bundle archives and the plaintext payload.
//!
//! An archive is a flat tree of `path → bytes` entries. Layout:
//!
//!   [ArchiveHeader 12 bytes]
//!   repeated entry_count times:
//!     [EntryHeader 12 bytes] [path bytes] [data bytes]
//!
//! Entries are written in path order, so equal trees encode to equal bytes.
//!
//! A payload tree holds `acknowledgement` and one `<appId>/<aduId>` file
//! per ADU. The encoded tree is LZ4-compressed before encryption.

use std::collections::BTreeMap;

use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const ARCHIVE_MAGIC: [u8; 4] = *b"BNDL";
pub const ARCHIVE_VERSION: u8 = 0x01;

/// Largest decompressed payload accepted. Guards the size prefix.
pub const MAX_PAYLOAD_PLAINTEXT: usize = 1 << 30;

/// Path of the acknowledgement entry in a payload tree.
pub const ACK_ENTRY: &str = "acknowledgement";

/// What an archive holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArchiveKind {
    /// Plaintext payload: acknowledgement + ADU files.
    Payload = 0x01,
    /// Outer bundle: header, id, signature, ciphertext.
    Bundle = 0x02,
}

impl TryFrom<u8> for ArchiveKind {
    type Error = ArchiveError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Payload),
            0x02 => Ok(Self::Bundle),
            other => Err(ArchiveError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct ArchiveHeader {
    magic: [u8; 4],
    version: u8,
    kind: u8,
    reserved: [u8; 2],
    entry_count: U32<BigEndian>,
}

assert_eq_size!(ArchiveHeader, [u8; 12]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct EntryHeader {
    path_len: U16<BigEndian>,
    reserved: [u8; 2],
    data_len: U64<BigEndian>,
}

assert_eq_size!(EntryHeader, [u8; 12]);

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive truncated at offset {0}")]
    Truncated(usize),

    #[error("bad archive magic")]
    BadMagic,

    #[error("unsupported archive version {0}")]
    BadVersion(u8),

    #[error("unknown archive kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("expected {expected:?} archive, found {found:?}")]
    WrongKind { expected: ArchiveKind, found: ArchiveKind },

    #[error("invalid entry path {0:?}")]
    BadPath(String),

    #[error("duplicate entry {0:?}")]
    Duplicate(String),

    #[error("missing entry {0:?}")]
    Missing(&'static str),

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("{0} trailing bytes after last entry")]
    Trailing(usize),
}

// ── Archive ───────────────────────────────────────────────────────────────────

/// An ordered tree of named byte entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub kind: ArchiveKind,
    pub entries: BTreeMap<String, Vec<u8>>,
}

impl Archive {
    pub fn new(kind: ArchiveKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, path: impl Into<String>, data: Vec<u8>) {
        self.entries.insert(path.into(), data);
    }

    pub fn get(&self, path: &'static str) -> Result<&[u8], ArchiveError> {
        self.entries
            .get(path)
            .map(Vec::as_slice)
            .ok_or(ArchiveError::Missing(path))
    }

    pub fn encode(&self) -> Vec<u8> {
        let body: usize = self.entries.iter().map(|(p, d)| 12 + p.len() + d.len()).sum();
        let mut out = Vec::with_capacity(12 + body);
        let header = ArchiveHeader {
            magic: ARCHIVE_MAGIC,
            version: ARCHIVE_VERSION,
            kind: self.kind as u8,
            reserved: [0; 2],
            entry_count: U32::new(self.entries.len() as u32),
        };
        out.extend_from_slice(header.as_bytes());
        for (path, data) in &self.entries {
            let entry = EntryHeader {
                path_len: U16::new(path.len() as u16),
                reserved: [0; 2],
                data_len: U64::new(data.len() as u64),
            };
            out.extend_from_slice(entry.as_bytes());
            out.extend_from_slice(path.as_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let header = bytes
            .get(..12)
            .and_then(ArchiveHeader::read_from)
            .ok_or(ArchiveError::Truncated(0))?;
        if header.magic != ARCHIVE_MAGIC {
            return Err(ArchiveError::BadMagic);
        }
        if header.version != ARCHIVE_VERSION {
            return Err(ArchiveError::BadVersion(header.version));
        }
        let kind = ArchiveKind::try_from(header.kind)?;

        let mut archive = Archive::new(kind);
        let mut pos = 12;
        for _ in 0..header.entry_count.get() {
            let entry = bytes
                .get(pos..pos + 12)
                .and_then(EntryHeader::read_from)
                .ok_or(ArchiveError::Truncated(pos))?;
            pos += 12;

            let path_len = entry.path_len.get() as usize;
            let path = bytes
                .get(pos..pos + path_len)
                .ok_or(ArchiveError::Truncated(pos))?;
            let path = std::str::from_utf8(path)
                .map_err(|_| ArchiveError::BadPath(String::from_utf8_lossy(path).into_owned()))?
                .to_string();
            pos += path_len;

            let data_len = usize::try_from(entry.data_len.get()).map_err(|_| ArchiveError::Truncated(pos))?;
            let end = pos.checked_add(data_len).ok_or(ArchiveError::Truncated(pos))?;
            let data = bytes.get(pos..end).ok_or(ArchiveError::Truncated(pos))?;
            pos = end;

            if archive.entries.insert(path.clone(), data.to_vec()).is_some() {
                return Err(ArchiveError::Duplicate(path));
            }
        }
        if pos != bytes.len() {
            return Err(ArchiveError::Trailing(bytes.len() - pos));
        }
        Ok(archive)
    }

    pub fn expect_kind(self, expected: ArchiveKind) -> Result<Self, ArchiveError> {
        if self.kind != expected {
            return Err(ArchiveError::WrongKind { expected, found: self.kind });
        }
        Ok(self)
    }
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// Application ids become directory names on both sides, so they are
/// restricted to a conservative alphabet.
pub fn is_valid_app_id(app_id: &str) -> bool {
    !app_id.is_empty()
        && app_id.len() <= 64
        && app_id != "."
        && app_id != ".."
        && app_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

/// One application data unit carried in a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub app_id: String,
    pub adu_id: u64,
    pub data: Vec<u8>,
}

/// Plaintext content of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Id of the newest peer bundle this side has processed.
    /// `None` marks a heartbeat: nothing received yet.
    pub ack: Option<String>,
    /// Sorted by `(app_id, adu_id)`.
    pub adus: Vec<Adu>,
}

impl Payload {
    pub fn new(ack: Option<String>, mut adus: Vec<Adu>) -> Self {
        adus.sort_by(|a, b| (&a.app_id, a.adu_id).cmp(&(&b.app_id, b.adu_id)));
        Self { ack, adus }
    }

    /// Digest over the acknowledgement and the sorted ADU set.
    ///
    /// Two payloads assembled from the same store state have the same
    /// fingerprint; any added, removed, or changed ADU alters it.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        match &self.ack {
            Some(ack) => {
                hasher.update(&[1]);
                hasher.update(&(ack.len() as u64).to_be_bytes());
                hasher.update(ack.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        for adu in &self.adus {
            hasher.update(&(adu.app_id.len() as u64).to_be_bytes());
            hasher.update(adu.app_id.as_bytes());
            hasher.update(&adu.adu_id.to_be_bytes());
            hasher.update(blake3::hash(&adu.data).as_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    /// Highest ADU id carried per application.
    pub fn app_maxima(&self) -> BTreeMap<String, u64> {
        let mut max = BTreeMap::new();
        for adu in &self.adus {
            let entry = max.entry(adu.app_id.clone()).or_insert(adu.adu_id);
            *entry = (*entry).max(adu.adu_id);
        }
        max
    }

    pub fn data_len(&self) -> usize {
        self.adus.iter().map(|a| a.data.len()).sum()
    }

    pub fn to_archive(&self) -> Archive {
        let mut archive = Archive::new(ArchiveKind::Payload);
        archive.insert(ACK_ENTRY, self.ack.clone().unwrap_or_default().into_bytes());
        for adu in &self.adus {
            archive.insert(format!("{}/{}", adu.app_id, adu.adu_id), adu.data.clone());
        }
        archive
    }

    pub fn from_archive(archive: Archive) -> Result<Self, ArchiveError> {
        let archive = archive.expect_kind(ArchiveKind::Payload)?;
        let mut ack = None;
        let mut adus = Vec::with_capacity(archive.entries.len().saturating_sub(1));
        for (path, data) in archive.entries {
            if path == ACK_ENTRY {
                let text = String::from_utf8(data).map_err(|_| ArchiveError::BadPath(path.clone()))?;
                ack = Some(text);
                continue;
            }
            let (app_id, id) = path
                .split_once('/')
                .ok_or_else(|| ArchiveError::BadPath(path.clone()))?;
            let adu_id: u64 = id.parse().map_err(|_| ArchiveError::BadPath(path.clone()))?;
            if !is_valid_app_id(app_id) || adu_id == 0 {
                return Err(ArchiveError::BadPath(path.clone()));
            }
            adus.push(Adu {
                app_id: app_id.to_string(),
                adu_id,
                data,
            });
        }
        let ack = ack.ok_or(ArchiveError::Missing(ACK_ENTRY))?;
        let ack = (!ack.is_empty()).then_some(ack);
        Ok(Payload::new(ack, adus))
    }

    /// Archive, then LZ4 block compression with a little-endian size prefix.
    pub fn encode(&self) -> Result<Vec<u8>, ArchiveError> {
        lz4::block::compress(&self.to_archive().encode(), None, true)
            .map_err(|e| ArchiveError::Compress(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let prefix: [u8; 4] = bytes
            .get(..4)
            .and_then(|p| p.try_into().ok())
            .ok_or(ArchiveError::Truncated(0))?;
        if u32::from_le_bytes(prefix) as usize > MAX_PAYLOAD_PLAINTEXT {
            return Err(ArchiveError::Decompress("declared size exceeds limit".into()));
        }
        let raw = lz4::block::decompress(bytes, None).map_err(|e| ArchiveError::Decompress(e.to_string()))?;
        Payload::from_archive(Archive::decode(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adu(app: &str, id: u64, data: &[u8]) -> Adu {
        Adu {
            app_id: app.to_string(),
            adu_id: id,
            data: data.to_vec(),
        }
    }

    #[test]
    fn payload_survives_compress_decompress() {
        let payload = Payload::new(
            Some("abcdef".into()),
            vec![adu("mail", 2, b"second"), adu("echo", 1, b""), adu("mail", 1, &[7u8; 4096])],
        );
        let bytes = payload.encode().unwrap();
        assert!(bytes.len() < 4096, "repetitive data should compress");
        assert_eq!(Payload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn heartbeat_has_no_ack() {
        let heartbeat = Payload::default();
        let back = Payload::decode(&heartbeat.encode().unwrap()).unwrap();
        assert_eq!(back.ack, None);
        assert!(back.adus.is_empty());
    }

    #[test]
    fn new_sorts_by_app_then_id() {
        let p = Payload::new(None, vec![adu("mail", 3, b""), adu("echo", 9, b""), adu("mail", 1, b"")]);
        let keys: Vec<_> = p.adus.iter().map(|a| (a.app_id.as_str(), a.adu_id)).collect();
        assert_eq!(keys, vec![("echo", 9), ("mail", 1), ("mail", 3)]);
    }

    #[test]
    fn fingerprint_tracks_ack_and_adu_set() {
        let base = Payload::new(Some("x".into()), vec![adu("mail", 1, b"a"), adu("mail", 2, b"b")]);
        let reordered = Payload::new(Some("x".into()), vec![adu("mail", 2, b"b"), adu("mail", 1, b"a")]);
        assert_eq!(base.fingerprint(), reordered.fingerprint());

        let other_ack = Payload::new(Some("y".into()), base.adus.clone());
        assert_ne!(base.fingerprint(), other_ack.fingerprint());

        let no_ack = Payload::new(None, base.adus.clone());
        let empty_ack = Payload::new(Some(String::new()), base.adus.clone());
        assert_ne!(no_ack.fingerprint(), empty_ack.fingerprint());

        let fewer = Payload::new(Some("x".into()), vec![adu("mail", 1, b"a")]);
        assert_ne!(base.fingerprint(), fewer.fingerprint());
    }

    #[test]
    fn app_maxima_per_app() {
        let p = Payload::new(None, vec![adu("mail", 4, b""), adu("mail", 6, b""), adu("echo", 2, b"")]);
        let max = p.app_maxima();
        assert_eq!(max.get("mail"), Some(&6));
        assert_eq!(max.get("echo"), Some(&2));
    }

    #[test]
    fn archive_encoding_is_deterministic() {
        let mut a = Archive::new(ArchiveKind::Bundle);
        a.insert("b", vec![2]);
        a.insert("a", vec![1]);
        let mut b = Archive::new(ArchiveKind::Bundle);
        b.insert("a", vec![1]);
        b.insert("b", vec![2]);
        assert_eq!(a.encode(), b.encode());
        assert_eq!(Archive::decode(&a.encode()).unwrap(), a);
    }

    #[test]
    fn truncated_archive_rejected() {
        let p = Payload::new(None, vec![adu("mail", 1, b"hello")]);
        let encoded = p.to_archive().encode();
        for cut in [0, 5, 12, 20, encoded.len() - 1] {
            assert!(Archive::decode(&encoded[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn traversal_paths_rejected() {
        let mut archive = Archive::new(ArchiveKind::Payload);
        archive.insert(ACK_ENTRY, Vec::new());
        archive.insert("../etc/1", b"x".to_vec());
        assert!(matches!(Payload::from_archive(archive), Err(ArchiveError::BadPath(_))));
    }

    #[test]
    fn wrong_kind_rejected() {
        let mut archive = Archive::new(ArchiveKind::Bundle);
        archive.insert(ACK_ENTRY, Vec::new());
        assert!(matches!(Payload::from_archive(archive), Err(ArchiveError::WrongKind { .. })));
    }

    #[test]
    fn app_id_alphabet() {
        assert!(is_valid_app_id("mail"));
        assert!(is_valid_app_id("com.example.echo_2"));
        assert!(!is_valid_app_id(""));
        assert!(!is_valid_app_id(".."));
        assert!(!is_valid_app_id("a/b"));
    }
}
