//! The outer bundle container: what a transport physically carries.
//!
//! Entries of the bundle archive:
//!   header       JSON `MessageHeader` (sender, recipient, epoch, counter)
//!   bundle.id    the opaque bundle id, UTF-8
//!   payload.sig  Ed25519 signature over header, id and ciphertext
//!   payload.enc  ChaCha20-Poly1305 ciphertext of the compressed payload
//!
//! Sealing is `serialize → compress → encrypt → sign`; opening checks the
//! signature first so nothing unauthenticated reaches the ratchet.

use crate::crypto::{Identity, PeerIdentity};
use crate::payload::{Archive, ArchiveError, ArchiveKind, Payload};
use crate::session::{MessageHeader, SecurityError, Session};

const HEADER_ENTRY: &str = "header";
const ID_ENTRY: &str = "bundle.id";
const SIG_ENTRY: &str = "payload.sig";
const ENC_ENTRY: &str = "payload.enc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBundle {
    pub header: MessageHeader,
    pub bundle_id: String,
    pub signature: [u8; 64],
    pub ciphertext: Vec<u8>,
}

impl From<ArchiveError> for SecurityError {
    fn from(e: ArchiveError) -> Self {
        SecurityError::FormatError(e.to_string())
    }
}

impl EncryptedBundle {
    /// Encrypt and sign `payload` for the session's peer under `bundle_id`.
    pub fn seal(
        identity: &Identity,
        session: &mut Session,
        bundle_id: &str,
        payload: &Payload,
    ) -> Result<Self, SecurityError> {
        let (header, ciphertext) = session.seal(&payload.encode()?)?;
        let signature = identity.sign(&signed_bytes(&header, bundle_id, &ciphertext));
        Ok(Self {
            header,
            bundle_id: bundle_id.to_string(),
            signature,
            ciphertext,
        })
    }

    /// Check the signature against `sender` and that `sender` is who the
    /// header claims. Does not touch session state.
    pub fn verify(&self, sender: &PeerIdentity) -> Result<(), SecurityError> {
        if &self.header.sender != sender {
            return Err(SecurityError::AuthenticationFailure(format!(
                "bundle claims sender {}, expected {}",
                self.header.sender.id(),
                sender.id()
            )));
        }
        sender
            .verify(&signed_bytes(&self.header, &self.bundle_id, &self.ciphertext), &self.signature)
            .map_err(|_| SecurityError::AuthenticationFailure("bad payload signature".into()))
    }

    /// Verify, decrypt with the session, and decode the payload.
    pub fn open(&self, session: &mut Session) -> Result<Payload, SecurityError> {
        self.verify(session.peer())?;
        let compressed = session.open(&self.header, &self.ciphertext)?;
        Ok(Payload::decode(&compressed)?)
    }

    pub fn to_archive(&self) -> Archive {
        let mut archive = Archive::new(ArchiveKind::Bundle);
        archive.insert(HEADER_ENTRY, self.header.to_bytes());
        archive.insert(ID_ENTRY, self.bundle_id.as_bytes().to_vec());
        archive.insert(SIG_ENTRY, self.signature.to_vec());
        archive.insert(ENC_ENTRY, self.ciphertext.clone());
        archive
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_archive().encode()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecurityError> {
        let archive = Archive::decode(bytes)?.expect_kind(ArchiveKind::Bundle)?;
        let header = MessageHeader::from_bytes(archive.get(HEADER_ENTRY)?)?;
        let bundle_id = std::str::from_utf8(archive.get(ID_ENTRY)?)
            .map_err(|_| SecurityError::FormatError("bundle id is not UTF-8".into()))?
            .to_string();
        let signature: [u8; 64] = archive
            .get(SIG_ENTRY)?
            .try_into()
            .map_err(|_| SecurityError::FormatError("signature must be 64 bytes".into()))?;
        let ciphertext = archive.get(ENC_ENTRY)?.to_vec();
        Ok(Self {
            header,
            bundle_id,
            signature,
            ciphertext,
        })
    }
}

/// Length-prefixed concatenation covered by the signature.
fn signed_bytes(header: &MessageHeader, bundle_id: &str, ciphertext: &[u8]) -> Vec<u8> {
    let header = header.to_bytes();
    let mut out = Vec::with_capacity(24 + header.len() + bundle_id.len() + ciphertext.len());
    for part in [header.as_slice(), bundle_id.as_bytes(), ciphertext] {
        out.extend_from_slice(&(part.len() as u64).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}
