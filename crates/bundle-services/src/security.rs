//! Bundle security — one local identity, one persisted session per peer.
//!
//! Sessions are created on first contact and saved to
//! `{root}/{peer}.json` after every seal or open. Session state that
//! cannot be read is replaced by a brand-new session and logged as a
//! recovery: the exchange keeps working, at the cost of forward-secrecy
//! continuity with that peer.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use bundle_core::bundle::EncryptedBundle;
use bundle_core::crypto::{Identity, PeerId, PeerIdentity};
use bundle_core::payload::Payload;
use bundle_core::recovery::{load_json, Recovery};
use bundle_core::session::{Direction, SecurityError, Session, SessionState};

use crate::locks::{hold, KeyedLocks};
use crate::persist::write_json_atomic;

#[derive(Clone)]
pub struct BundleSecurity {
    identity: Arc<Identity>,
    root: PathBuf,
    locks: KeyedLocks<PeerId>,
}

impl BundleSecurity {
    pub fn new(identity: Arc<Identity>, root: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn local(&self) -> PeerIdentity {
        self.identity.public()
    }

    /// Load the session with `peer`, or start one.
    ///
    /// `Loaded` covers both a resumed session and a first contact.
    /// `Recovered` means stored state existed but was unusable.
    pub fn load_session(&self, peer: &PeerIdentity) -> Recovery<Session> {
        let path = self.path(&peer.id());
        let stored: Recovery<Option<SessionState>> = load_json(&path, || None);
        match stored {
            Recovery::Loaded(None) => Recovery::Loaded(Session::new(&self.identity, *peer)),
            Recovery::Loaded(Some(state)) if &state.peer != peer => Recovery::Recovered {
                value: Session::new(&self.identity, *peer),
                reason: format!("{}: session belongs to {}", path.display(), state.peer.id()),
            },
            Recovery::Loaded(Some(state)) => match Session::resume(&self.identity, state) {
                Ok(session) => Recovery::Loaded(session),
                Err(e) => Recovery::Recovered {
                    value: Session::new(&self.identity, *peer),
                    reason: format!("{}: {e}", path.display()),
                },
            },
            Recovery::Recovered { reason, .. } => Recovery::Recovered {
                value: Session::new(&self.identity, *peer),
                reason,
            },
            Recovery::Fatal(e) => Recovery::Fatal(e),
        }
    }

    /// Serialize, compress, encrypt and sign `payload` under `bundle_id`.
    pub fn encrypt_payload(
        &self,
        peer: &PeerIdentity,
        bundle_id: &str,
        payload: &Payload,
    ) -> Result<EncryptedBundle, SecurityError> {
        self.with_session(peer, |identity, session| {
            EncryptedBundle::seal(identity, session, bundle_id, payload)
        })
    }

    /// Verify and decrypt a bundle from `peer`.
    ///
    /// Session state is saved only when decryption succeeded, so a
    /// rejected bundle never moves the ratchet.
    pub fn decrypt_payload(
        &self,
        peer: &PeerIdentity,
        bundle: &EncryptedBundle,
    ) -> Result<Payload, SecurityError> {
        bundle.verify(peer)?;
        self.with_session(peer, |_, session| bundle.open(session))
    }

    pub fn encrypt_bundle_id(
        &self,
        peer: &PeerIdentity,
        counter: u64,
        direction: Direction,
    ) -> Result<String, SecurityError> {
        self.with_session(peer, |_, session| Ok(session.encrypt_bundle_id(counter, direction)))
    }

    pub fn decrypt_bundle_id(
        &self,
        peer: &PeerIdentity,
        bundle_id: &str,
    ) -> Result<(u64, Direction), SecurityError> {
        self.with_session(peer, |_, session| session.decrypt_bundle_id(bundle_id))
    }

    pub fn compare_bundle_ids(
        &self,
        peer: &PeerIdentity,
        a: &str,
        b: &str,
        direction: Direction,
    ) -> Result<Ordering, SecurityError> {
        self.with_session(peer, |_, session| session.compare_bundle_ids(a, b, direction))
    }

    /// Decrypt a bundle from `peer` and hand the payload to `apply`.
    ///
    /// The advanced session is saved only if `apply` succeeds. A bundle
    /// whose application failed can therefore be opened again when the
    /// peer retransmits the same bytes. `apply` runs under the session
    /// lock and gets the session for bundle-id work.
    pub fn open_and_apply<T>(
        &self,
        peer: &PeerIdentity,
        bundle: &EncryptedBundle,
        apply: impl FnOnce(Payload, &Session) -> anyhow::Result<T>,
    ) -> Result<anyhow::Result<T>, SecurityError> {
        bundle.verify(peer)?;
        self.with_session_commit(peer, |_, session| {
            let payload = bundle.open(session)?;
            let applied = apply(payload, session);
            let commit = applied.is_ok();
            Ok((applied, commit))
        })
    }

    /// Run `f` on the peer's session under its lock; save on success.
    fn with_session<T>(
        &self,
        peer: &PeerIdentity,
        f: impl FnOnce(&Identity, &mut Session) -> Result<T, SecurityError>,
    ) -> Result<T, SecurityError> {
        self.with_session_commit(peer, |identity, session| f(identity, session).map(|v| (v, true)))
    }

    /// `f` returns the value and whether to keep the mutated session.
    fn with_session_commit<T>(
        &self,
        peer: &PeerIdentity,
        f: impl FnOnce(&Identity, &mut Session) -> Result<(T, bool), SecurityError>,
    ) -> Result<T, SecurityError> {
        let peer_id = peer.id();
        let lock = self.locks.handle(&peer_id);
        let _guard = hold(&lock);

        let path = self.path(&peer_id);
        let (mut session, fresh) = match self.load_session(peer) {
            Recovery::Loaded(session) => {
                let fresh = !path.exists();
                (session, fresh)
            }
            Recovery::Recovered { value, reason } => {
                tracing::warn!(peer = %peer_id, reason = %reason, "session state unreadable, starting a new session");
                (value, true)
            }
            Recovery::Fatal(e) => {
                return Err(SecurityError::SessionError(format!("cannot load session: {:#}", anyhow::Error::new(e))));
            }
        };

        let result = f(&self.identity, &mut session);
        if matches!(result, Ok((_, true))) {
            self.save(&path, &session)?;
            if fresh {
                tracing::info!(peer = %peer_id, "session established");
            }
        }
        result.map(|(value, _)| value)
    }

    fn save(&self, path: &std::path::Path, session: &Session) -> Result<(), SecurityError> {
        write_json_atomic(path, session.state())
            .map_err(|e| SecurityError::SessionError(format!("cannot persist session: {e:#}")))
    }

    fn path(&self, peer: &PeerId) -> PathBuf {
        self.root.join(format!("{peer}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundle_core::payload::Adu;

    fn pair() -> (tempfile::TempDir, BundleSecurity, BundleSecurity) {
        let dir = tempfile::tempdir().unwrap();
        let a = BundleSecurity::new(Arc::new(Identity::generate()), dir.path().join("a"));
        let b = BundleSecurity::new(Arc::new(Identity::generate()), dir.path().join("b"));
        (dir, a, b)
    }

    fn payload() -> Payload {
        Payload::new(
            Some("abcd".into()),
            vec![Adu {
                app_id: "mail".into(),
                adu_id: 1,
                data: b"hello".to_vec(),
            }],
        )
    }

    #[test]
    fn payload_round_trip_across_instances() {
        let (_dir, a, b) = pair();
        let id = a.encrypt_bundle_id(&b.local(), 0, Direction::Upstream).unwrap();
        let bundle = a.encrypt_payload(&b.local(), &id, &payload()).unwrap();

        let bytes = bundle.to_bytes();
        let parsed = EncryptedBundle::from_bytes(&bytes).unwrap();
        assert_eq!(b.decrypt_payload(&a.local(), &parsed).unwrap(), payload());
        assert_eq!(b.decrypt_bundle_id(&a.local(), &id).unwrap(), (0, Direction::Upstream));
    }

    #[test]
    fn replay_is_session_error() {
        let (_dir, a, b) = pair();
        let bundle = a.encrypt_payload(&b.local(), "00", &payload()).unwrap();
        b.decrypt_payload(&a.local(), &bundle).unwrap();
        assert!(matches!(
            b.decrypt_payload(&a.local(), &bundle),
            Err(SecurityError::SessionError(_))
        ));
    }

    #[test]
    fn wrong_sender_is_authentication_failure() {
        let (dir, a, b) = pair();
        let c = BundleSecurity::new(Arc::new(Identity::generate()), dir.path().join("c"));
        let bundle = a.encrypt_payload(&b.local(), "00", &payload()).unwrap();
        assert!(matches!(
            b.decrypt_payload(&c.local(), &bundle),
            Err(SecurityError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn corrupt_session_is_recreated() {
        let (dir, a, b) = pair();
        a.encrypt_payload(&b.local(), "00", &payload()).unwrap();
        let path = dir.path().join("a").join(format!("{}.json", b.local().id()));
        assert!(path.exists());

        std::fs::write(&path, b"not json").unwrap();
        assert!(a.load_session(&b.local()).is_recovered());

        // A new epoch still reaches the peer.
        let bundle = a.encrypt_payload(&b.local(), "01", &payload()).unwrap();
        assert_eq!(b.decrypt_payload(&a.local(), &bundle).unwrap(), payload());
        assert!(!a.load_session(&b.local()).is_recovered());
    }

    #[test]
    fn compare_orders_by_counter() {
        let (_dir, a, b) = pair();
        let lo = a.encrypt_bundle_id(&b.local(), 2, Direction::Downstream).unwrap();
        let hi = a.encrypt_bundle_id(&b.local(), 7, Direction::Downstream).unwrap();
        assert_eq!(
            b.compare_bundle_ids(&a.local(), &lo, &hi, Direction::Downstream).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            a.compare_bundle_ids(&b.local(), &hi, &hi, Direction::Downstream).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn failed_apply_leaves_bundle_openable() {
        let (_dir, a, b) = pair();
        let bundle = a.encrypt_payload(&b.local(), "00", &payload()).unwrap();

        let first = b
            .open_and_apply(&a.local(), &bundle, |_, _| -> anyhow::Result<()> { anyhow::bail!("disk full") })
            .unwrap();
        assert!(first.is_err());

        let second = b
            .open_and_apply(&a.local(), &bundle, |p, _| Ok(p.adus.len()))
            .unwrap();
        assert_eq!(second.unwrap(), 1);

        assert!(matches!(
            b.open_and_apply(&a.local(), &bundle, |_, _| Ok(())),
            Err(SecurityError::SessionError(_))
        ));
    }
}
