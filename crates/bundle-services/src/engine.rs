//! Bundle transmission engine — one instance per node, shared by the
//! client and server roles.
//!
//! Outbound: embed the newest acknowledgement, pull unacknowledged ADUs
//! up to the payload budget, and either reuse the last bundle (identical
//! payload) or mint a new counter, encrypt, and materialize the bundle in
//! the outbox.
//!
//! Inbound, per bundle:
//!   parse → verify signature → decrypt id → classify against recv window
//!   → decrypt payload → store ADUs → apply ack → advance recv window
//!
//! Stale bundles are dropped before the payload is decrypted, so a
//! retransmission never touches the ratchet. Every step for one peer runs
//! under that peer's lock; different peers proceed in parallel.
//!
//! On-disk layout under the engine root:
//!   adu/       ADU store
//!   windows/   per-peer send and recv windows
//!   ledgers/   per-peer ack, last-sent, and sent bookkeeping
//!   sessions/  per-peer ratchet state
//!   outbox/    materialized outbound bundles, named by bundle id

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use bundle_core::bundle::EncryptedBundle;
use bundle_core::crypto::{Identity, PeerId, PeerIdentity};
use bundle_core::payload::{Adu, Payload};
use bundle_core::recovery::Recovery;
use bundle_core::session::{Direction, SecurityError, Session};

use crate::adu_store::{AduDirection, AduStore};
use crate::consumer::AduConsumer;
use crate::ledger::{LedgerStore, PeerLedger};
use crate::locks::{hold, KeyedLocks};
use crate::persist::{remove_if_exists, write_atomic};
use crate::security::BundleSecurity;
use crate::violations::{ViolationKind, ViolationLog};
use crate::window::{Classification, PeerWindows, WindowStore};

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// Why a bundle was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleFault {
    /// File or network hiccup. Nothing was committed; retrying is safe.
    TransientIo,
    /// Bad signature, wrong recipient, replay, or AEAD failure.
    AuthenticationFailure,
    /// Out-of-window counter, malformed container or identifier.
    ProtocolViolation,
    /// Persisted state could not be read at all.
    StateCorruption,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Payload applied. `new_adus` counts ADUs stored for the first time.
    Applied { counter: u64, new_adus: usize },
    /// Already applied earlier; dropped without error.
    Stale { counter: u64 },
    /// Beyond the receive window; dropped and recorded as a violation.
    Invalid { counter: u64 },
    Rejected { fault: BundleFault, reason: String },
}

impl ReceiveOutcome {
    fn rejected(fault: BundleFault, reason: impl Into<String>) -> Self {
        ReceiveOutcome::Rejected {
            fault,
            reason: reason.into(),
        }
    }
}

/// Result of processing one received bundle.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub bundle_id: Option<String>,
    /// Sender, once its signature verified.
    pub peer: Option<PeerIdentity>,
    pub outcome: ReceiveOutcome,
}

/// A bundle ready to hand to the exchange protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBundle {
    pub bundle_id: String,
    pub counter: u64,
    pub path: PathBuf,
    /// True when the previous bundle was reused.
    pub retransmission: bool,
    pub adu_count: usize,
}

/// Window and ledger snapshot for one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub peer: PeerId,
    pub send_window: [u64; 2],
    pub next_counter: u64,
    pub recv_window: [u64; 2],
    pub unacknowledged: usize,
    pub last_sent: Option<String>,
    pub ack: Option<String>,
    pub largest_received: Option<u64>,
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Direction of bundles this node mints.
    pub outbound: Direction,
    pub window_length: u64,
    pub payload_budget: u64,
    /// Applications drained first, in this order.
    pub app_ids: Vec<String>,
    /// If set, bundles from any other sender are rejected.
    pub accept_only: Option<PeerIdentity>,
}

#[derive(Clone)]
pub struct TransmissionEngine {
    security: BundleSecurity,
    adus: AduStore,
    windows: WindowStore,
    ledgers: LedgerStore,
    outbox: PathBuf,
    violations: ViolationLog,
    consumer: Arc<dyn AduConsumer>,
    locks: KeyedLocks<PeerId>,
    settings: Arc<EngineSettings>,
}

impl TransmissionEngine {
    pub fn open(
        root: &Path,
        identity: Arc<Identity>,
        settings: EngineSettings,
        consumer: Arc<dyn AduConsumer>,
    ) -> anyhow::Result<Self> {
        let outbox = root.join("outbox");
        for dir in ["windows", "ledgers", "sessions", "outbox"] {
            std::fs::create_dir_all(root.join(dir))
                .with_context(|| format!("failed to create {}", root.join(dir).display()))?;
        }
        Ok(Self {
            security: BundleSecurity::new(identity, root.join("sessions")),
            adus: AduStore::new(root.join("adu"))?,
            windows: WindowStore::new(root.join("windows"), settings.window_length),
            ledgers: LedgerStore::new(root.join("ledgers")),
            outbox,
            violations: ViolationLog::default(),
            consumer,
            locks: KeyedLocks::new(),
            settings: Arc::new(settings),
        })
    }

    pub fn adus(&self) -> &AduStore {
        &self.adus
    }

    pub fn security(&self) -> &BundleSecurity {
        &self.security
    }

    pub fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    pub fn local(&self) -> PeerIdentity {
        self.security.local()
    }

    pub fn outbound_direction(&self) -> Direction {
        self.settings.outbound
    }

    pub fn outbox_path(&self, bundle_id: &str) -> PathBuf {
        self.outbox.join(bundle_id)
    }

    /// Bytes of a materialized outbound bundle, if still held.
    pub fn read_outbox(&self, bundle_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.outbox_path(bundle_id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Queue outbound application data for `peer`.
    pub fn submit(&self, peer: &PeerId, app_id: &str, data: &[u8]) -> anyhow::Result<u64> {
        Ok(self.adus.append(peer, app_id, data)?)
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// The bundle to send `peer` now: the previous one if nothing changed,
    /// otherwise a freshly minted one.
    pub fn generate(&self, peer: &PeerIdentity) -> anyhow::Result<OutboundBundle> {
        let peer_id = peer.id();
        let lock = self.locks.handle(&peer_id);
        let _guard = hold(&lock);

        let mut ledger = self.load_ledger(&peer_id)?;
        let mut windows = self.load_windows(&peer_id)?;

        let payload = self.assemble(&peer_id, &ledger)?;
        let fingerprint = payload.fingerprint();
        let adu_count = payload.adus.len();

        if let Some(last) = ledger.is_retransmission(&fingerprint).cloned() {
            let path = self.outbox_path(&last.bundle_id);
            if !path.exists() {
                // Outbox copy lost: re-encrypt the same payload under the same id.
                let bundle = self.security.encrypt_payload(peer, &last.bundle_id, &payload)?;
                write_atomic(&path, &bundle.to_bytes())?;
            }
            tracing::debug!(peer = %peer_id, bundle_id = %last.bundle_id, "payload unchanged, retransmitting");
            return Ok(OutboundBundle {
                bundle_id: last.bundle_id,
                counter: last.counter,
                path,
                retransmission: true,
                adu_count,
            });
        }

        let Some(counter) = windows.send.mint() else {
            let Some(last) = ledger.last_sent.clone() else {
                anyhow::bail!("send window to {peer_id} is full and nothing was sent");
            };
            let path = self.outbox_path(&last.bundle_id);
            anyhow::ensure!(
                path.exists(),
                "send window to {peer_id} is full and bundle {} is gone",
                last.bundle_id
            );
            tracing::warn!(
                peer = %peer_id,
                begin = windows.send.begin,
                "send window full, retransmitting last bundle"
            );
            return Ok(OutboundBundle {
                bundle_id: last.bundle_id,
                counter: last.counter,
                path,
                retransmission: true,
                adu_count: last.adu_count,
            });
        };

        let bundle_id = self
            .security
            .encrypt_bundle_id(peer, counter, self.settings.outbound)?;
        self.windows.save(&peer_id, &windows)?;

        let bundle = self.security.encrypt_payload(peer, &bundle_id, &payload)?;
        let path = self.outbox_path(&bundle_id);
        write_atomic(&path, &bundle.to_bytes())?;

        let maxima = payload.app_maxima();
        ledger.record_sent(&bundle_id, counter, fingerprint, adu_count, maxima.clone());
        self.ledgers.save(&peer_id, &ledger)?;
        for (app_id, max) in &maxima {
            self.adus.mark_progress(&peer_id, app_id, AduDirection::Send, *max)?;
        }

        tracing::info!(
            peer = %peer_id,
            counter,
            bundle_id = %bundle_id,
            adus = adu_count,
            "bundle minted"
        );
        Ok(OutboundBundle {
            bundle_id,
            counter,
            path,
            retransmission: false,
            adu_count,
        })
    }

    /// Acknowledgement plus every unacknowledged ADU that fits the budget.
    fn assemble(&self, peer: &PeerId, ledger: &PeerLedger) -> anyhow::Result<Payload> {
        let ack = ledger.ack.as_ref().map(|a| a.bundle_id.clone());
        let budget = self.settings.payload_budget as usize;

        let mut apps = self.settings.app_ids.clone();
        for app in self.adus.apps(peer, AduDirection::Send) {
            if !apps.contains(&app) {
                apps.push(app);
            }
        }

        let mut used = 0usize;
        let mut adus = Vec::new();
        'apps: for app_id in &apps {
            let meta = self.adus.metadata(peer, app_id, AduDirection::Send)?;
            for stored in self
                .adus
                .list_from(peer, app_id, AduDirection::Send, meta.last_deleted_id + 1)?
            {
                let stored = stored?;
                let fits = used + stored.data.len() <= budget;
                // A single oversized ADU still travels alone.
                if !fits && !adus.is_empty() {
                    tracing::debug!(peer = %peer, used, budget, "payload budget reached");
                    break 'apps;
                }
                used += stored.data.len();
                adus.push(Adu {
                    app_id: stored.app_id,
                    adu_id: stored.adu_id,
                    data: stored.data.to_vec(),
                });
                if !fits {
                    break 'apps;
                }
            }
        }
        Ok(Payload::new(ack, adus))
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Process a batch of received bundle files.
    ///
    /// Each file is removed once its attempt completes, except after a
    /// transient I/O failure, which leaves it for the next batch. The
    /// consumer hears `on_batch_complete` once at the end.
    pub fn process_batch(&self, files: &[PathBuf]) -> Vec<Receipt> {
        let mut receipts = Vec::with_capacity(files.len());
        for path in files {
            let receipt = match std::fs::read(path) {
                Ok(bytes) => self.receive(&bytes),
                Err(e) => Receipt {
                    bundle_id: None,
                    peer: None,
                    outcome: ReceiveOutcome::rejected(
                        BundleFault::TransientIo,
                        format!("failed to read {}: {e}", path.display()),
                    ),
                },
            };
            let keep = matches!(
                receipt.outcome,
                ReceiveOutcome::Rejected {
                    fault: BundleFault::TransientIo,
                    ..
                }
            );
            if !keep {
                if let Err(e) = remove_if_exists(path) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to remove processed bundle");
                }
            }
            receipts.push(receipt);
        }
        if !files.is_empty() {
            self.consumer.on_batch_complete();
        }
        receipts
    }

    /// Process one received bundle. Never fails: every problem becomes an
    /// outcome on the receipt.
    pub fn receive(&self, bytes: &[u8]) -> Receipt {
        let bundle = match EncryptedBundle::from_bytes(bytes) {
            Ok(b) => b,
            Err(e) => {
                self.violations
                    .record(ViolationKind::Malformed, "unknown", "", e.to_string());
                return Receipt {
                    bundle_id: None,
                    peer: None,
                    outcome: ReceiveOutcome::rejected(BundleFault::ProtocolViolation, e.to_string()),
                };
            }
        };
        let bundle_id = bundle.bundle_id.clone();
        let sender = bundle.header.sender;
        let receipt = |peer: Option<PeerIdentity>, outcome| Receipt {
            bundle_id: Some(bundle_id.clone()),
            peer,
            outcome,
        };

        if let Err(reason) = self.authenticate(&bundle) {
            tracing::warn!(sender = %sender.id(), bundle_id = %bundle_id, reason = %reason, "bundle discarded");
            self.violations.record(
                ViolationKind::Authentication,
                sender.id().as_str(),
                &bundle_id,
                reason.clone(),
            );
            return receipt(None, ReceiveOutcome::rejected(BundleFault::AuthenticationFailure, reason));
        }

        let outcome = self.receive_from(&sender, &bundle);
        receipt(Some(sender), outcome)
    }

    /// Recipient, allowed sender, and signature. Touches no state.
    fn authenticate(&self, bundle: &EncryptedBundle) -> Result<(), String> {
        if bundle.header.recipient != self.local() {
            return Err("bundle addressed to another identity".into());
        }
        if let Some(only) = &self.settings.accept_only {
            if &bundle.header.sender != only {
                return Err(format!("unexpected sender {}", bundle.header.sender.id()));
            }
        }
        bundle.verify(&bundle.header.sender).map_err(|e| e.to_string())
    }

    fn receive_from(&self, peer: &PeerIdentity, bundle: &EncryptedBundle) -> ReceiveOutcome {
        let peer_id = peer.id();
        let lock = self.locks.handle(&peer_id);
        let _guard = hold(&lock);
        let inbound = self.settings.outbound.reverse();

        let counter = match self.security.decrypt_bundle_id(peer, &bundle.bundle_id) {
            Ok((counter, direction)) if direction == inbound => counter,
            Ok((_, direction)) => {
                self.violations.record(
                    ViolationKind::WrongDirection,
                    peer_id.as_str(),
                    &bundle.bundle_id,
                    format!("{direction:?} bundle id on {inbound:?} path"),
                );
                return ReceiveOutcome::rejected(BundleFault::ProtocolViolation, "bundle id has wrong direction");
            }
            Err(e) => return self.security_rejection(&peer_id, &bundle.bundle_id, e),
        };

        let windows = match self.load_windows(&peer_id) {
            Ok(w) => w,
            Err(e) => return ReceiveOutcome::rejected(BundleFault::StateCorruption, format!("{e:#}")),
        };
        match windows.recv.classify(counter) {
            Classification::Stale => {
                tracing::debug!(peer = %peer_id, counter, begin = windows.recv.begin, "stale bundle dropped");
                return ReceiveOutcome::Stale { counter };
            }
            Classification::Invalid => {
                self.violations.record(
                    ViolationKind::OutOfWindow,
                    peer_id.as_str(),
                    &bundle.bundle_id,
                    format!(
                        "counter {counter} outside [{}, {}]",
                        windows.recv.begin,
                        windows.recv.end()
                    ),
                );
                return ReceiveOutcome::Invalid { counter };
            }
            Classification::Expected => {}
        }

        let applied = self.security.open_and_apply(peer, bundle, |payload, session| {
            self.apply(&peer_id, session, &bundle.bundle_id, counter, windows, payload)
        });
        match applied {
            Ok(Ok(new_adus)) => {
                tracing::info!(peer = %peer_id, counter, new_adus, "bundle applied");
                ReceiveOutcome::Applied { counter, new_adus }
            }
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_id, counter, error = %format!("{e:#}"), "bundle not applied");
                ReceiveOutcome::rejected(BundleFault::TransientIo, format!("{e:#}"))
            }
            Err(e) => self.security_rejection(&peer_id, &bundle.bundle_id, e),
        }
    }

    /// Steps after decryption. Caller holds the peer lock. Returns how many
    /// ADUs were new.
    ///
    /// Received ADUs are stored before the acknowledgement touches anything,
    /// and the windows are saved last. A failure at any step leaves the
    /// bundle classified as expected, so a retry redoes every step.
    fn apply(
        &self,
        peer: &PeerId,
        session: &Session,
        bundle_id: &str,
        counter: u64,
        mut windows: PeerWindows,
        payload: Payload,
    ) -> anyhow::Result<usize> {
        let mut ledger = self.load_ledger(peer)?;
        let acked = payload
            .ack
            .as_deref()
            .and_then(|ack| self.check_ack(peer, session, ack, &windows));

        let mut new_adus = 0;
        let mut delivered: BTreeMap<&str, u64> = BTreeMap::new();
        for adu in &payload.adus {
            if self
                .adus
                .put(peer, &adu.app_id, AduDirection::Recv, adu.adu_id, &adu.data)?
            {
                self.consumer
                    .on_adu(peer, &adu.app_id, adu.adu_id, &adu.data);
                new_adus += 1;
                delivered.insert(&adu.app_id, adu.adu_id);
            }
        }
        for (app_id, adu_id) in delivered {
            self.adus
                .mark_progress(peer, app_id, AduDirection::Recv, adu_id)?;
        }

        if let Some(acked) = acked {
            self.apply_ack(peer, acked, &mut windows, &mut ledger)?;
        }
        ledger.record_received(bundle_id, counter);
        self.ledgers.save(peer, &ledger)?;
        windows.recv.advance(counter);
        self.windows.save(peer, &windows)?;
        Ok(new_adus)
    }

    /// Decrypt an embedded acknowledgement. Malformed or impossible acks
    /// are recorded as violations and ignored.
    fn check_ack(&self, peer: &PeerId, session: &Session, ack: &str, windows: &PeerWindows) -> Option<u64> {
        let (acked, direction) = match session.decrypt_bundle_id(ack) {
            Ok(v) => v,
            Err(e) => {
                self.violations
                    .record(ViolationKind::Malformed, peer.as_str(), ack, format!("bad acknowledgement: {e}"));
                return None;
            }
        };
        if direction != self.settings.outbound || acked >= windows.send.next {
            self.violations.record(
                ViolationKind::Malformed,
                peer.as_str(),
                ack,
                format!(
                    "acknowledges {direction:?} counter {acked}, next to mint is {}",
                    windows.send.next
                ),
            );
            return None;
        }
        Some(acked)
    }

    /// The peer proved receipt of everything up to `acked`: slide the send
    /// window, retire sent bundles, drop ADUs and outbox copies.
    ///
    /// Retiring runs even when the window is already past `acked`, so an
    /// earlier attempt that failed part way is finished here.
    fn apply_ack(
        &self,
        peer: &PeerId,
        acked: u64,
        windows: &mut PeerWindows,
        ledger: &mut PeerLedger,
    ) -> anyhow::Result<()> {
        windows.send.advance(acked);
        let (retired, safe) = ledger.retire_acked(acked);
        if retired.is_empty() {
            return Ok(());
        }
        for (app_id, max) in &safe {
            self.adus
                .delete_up_to(peer, app_id, AduDirection::Send, *max)?;
        }
        for bundle_id in &retired {
            remove_if_exists(&self.outbox_path(bundle_id))?;
        }
        tracing::debug!(peer = %peer, acked, retired = retired.len(), "acknowledgement applied");
        Ok(())
    }

    fn security_rejection(&self, peer: &PeerId, bundle_id: &str, e: SecurityError) -> ReceiveOutcome {
        match e {
            SecurityError::FormatError(reason) => {
                self.violations
                    .record(ViolationKind::Malformed, peer.as_str(), bundle_id, reason.clone());
                ReceiveOutcome::rejected(BundleFault::ProtocolViolation, reason)
            }
            SecurityError::AuthenticationFailure(reason) | SecurityError::SessionError(reason) => {
                tracing::warn!(peer = %peer, bundle_id, reason = %reason, "bundle discarded");
                ReceiveOutcome::rejected(BundleFault::AuthenticationFailure, reason)
            }
        }
    }

    // ── State ────────────────────────────────────────────────────────────────

    pub fn status(&self, peer: &PeerId) -> anyhow::Result<PeerStatus> {
        let lock = self.locks.handle(peer);
        let _guard = hold(&lock);
        let windows = self.load_windows(peer)?;
        let ledger = self.load_ledger(peer)?;
        Ok(PeerStatus {
            peer: peer.clone(),
            send_window: [windows.send.begin, windows.send.end()],
            next_counter: windows.send.next,
            recv_window: [windows.recv.begin, windows.recv.end()],
            unacknowledged: ledger.sent.len(),
            last_sent: ledger.last_sent.map(|l| l.bundle_id),
            ack: ledger.ack.map(|a| a.bundle_id),
            largest_received: ledger.largest_received,
        })
    }

    /// Bundle ids the peer may send next, lowest first.
    pub fn expected_ids(&self, peer: &PeerIdentity) -> anyhow::Result<Vec<String>> {
        let peer_id = peer.id();
        let windows = {
            let lock = self.locks.handle(&peer_id);
            let _guard = hold(&lock);
            self.load_windows(&peer_id)?
        };
        let inbound = self.settings.outbound.reverse();
        windows
            .recv
            .counters()
            .map(|c| Ok(self.security.encrypt_bundle_id(peer, c, inbound)?))
            .collect()
    }

    fn load_windows(&self, peer: &PeerId) -> anyhow::Result<PeerWindows> {
        match self.windows.load(peer) {
            Recovery::Loaded(w) => Ok(w),
            Recovery::Recovered { value, reason } => {
                tracing::warn!(peer = %peer, reason = %reason, "window state unreadable, starting fresh windows");
                Ok(value)
            }
            Recovery::Fatal(e) => Err(e).context("window state"),
        }
    }

    fn load_ledger(&self, peer: &PeerId) -> anyhow::Result<PeerLedger> {
        match self.ledgers.load(peer) {
            Recovery::Loaded(l) => Ok(l),
            Recovery::Recovered { value, reason } => {
                tracing::warn!(peer = %peer, reason = %reason, "ledger unreadable, starting fresh ledger");
                Ok(value)
            }
            Recovery::Fatal(e) => Err(e).context("ledger state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ChannelConsumer, ConsumerEvent, NullConsumer};
    use std::fs;

    struct Pair {
        _tmp: tempfile::TempDir,
        client: TransmissionEngine,
        server: TransmissionEngine,
        client_key: PeerIdentity,
        server_key: PeerIdentity,
    }

    fn engine(
        root: &Path,
        identity: Arc<Identity>,
        outbound: Direction,
        accept_only: Option<PeerIdentity>,
        window_length: u64,
        payload_budget: u64,
        consumer: Arc<dyn AduConsumer>,
    ) -> TransmissionEngine {
        let settings = EngineSettings {
            outbound,
            window_length,
            payload_budget,
            app_ids: vec!["mail".into(), "echo".into()],
            accept_only,
        };
        TransmissionEngine::open(root, identity, settings, consumer).unwrap()
    }

    fn pair_with(client_window: u64, server_window: u64, budget: u64) -> Pair {
        let tmp = tempfile::tempdir().unwrap();
        let client_id = Arc::new(Identity::generate());
        let server_id = Arc::new(Identity::generate());
        let client_key = client_id.public();
        let server_key = server_id.public();
        let client = engine(
            &tmp.path().join("client"),
            client_id,
            Direction::Upstream,
            Some(server_key),
            client_window,
            budget,
            Arc::new(NullConsumer),
        );
        let server = engine(
            &tmp.path().join("server"),
            server_id,
            Direction::Downstream,
            None,
            server_window,
            budget,
            Arc::new(NullConsumer),
        );
        Pair {
            _tmp: tmp,
            client,
            server,
            client_key,
            server_key,
        }
    }

    fn pair() -> Pair {
        pair_with(10, 10, 1_000_000)
    }

    fn bytes(bundle: &OutboundBundle) -> Vec<u8> {
        fs::read(&bundle.path).unwrap()
    }

    fn pending(engine: &TransmissionEngine, peer: &PeerIdentity, app: &str) -> usize {
        engine
            .adus()
            .list_from(&peer.id(), app, AduDirection::Send, 1)
            .unwrap()
            .count()
    }

    #[test]
    fn end_to_end_ack_cycle() {
        let p = pair();
        for i in 1..=5 {
            p.client
                .submit(&p.server_key.id(), "mail", format!("message {i}").as_bytes())
                .unwrap();
        }

        let b1 = p.client.generate(&p.server_key).unwrap();
        assert_eq!((b1.counter, b1.adu_count, b1.retransmission), (0, 5, false));

        let receipt = p.server.receive(&bytes(&b1));
        assert_eq!(receipt.outcome, ReceiveOutcome::Applied { counter: 0, new_adus: 5 });
        assert_eq!(receipt.peer, Some(p.client_key));
        let meta = p
            .server
            .adus()
            .metadata(&p.client_key.id(), "mail", AduDirection::Recv)
            .unwrap();
        assert_eq!((meta.last_added_id, meta.last_delivered_id), (5, 5));

        let s1 = p.server.generate(&p.client_key).unwrap();
        assert_eq!(s1.adu_count, 0);

        // Nothing is deleted until the server's acknowledgement arrives.
        assert_eq!(pending(&p.client, &p.server_key, "mail"), 5);
        assert!(p
            .client
            .expected_ids(&p.server_key)
            .unwrap()
            .contains(&s1.bundle_id));

        let receipt = p.client.receive(&bytes(&s1));
        assert_eq!(receipt.outcome, ReceiveOutcome::Applied { counter: 0, new_adus: 0 });
        assert_eq!(pending(&p.client, &p.server_key, "mail"), 0);
        assert!(!b1.path.exists(), "acknowledged bundle leaves the outbox");

        let b2 = p.client.generate(&p.server_key).unwrap();
        assert_eq!((b2.counter, b2.adu_count), (1, 0));
        assert_ne!(b2.bundle_id, b1.bundle_id);
        let status = p.client.status(&p.server_key.id()).unwrap();
        assert_eq!(status.ack, Some(s1.bundle_id.clone()));
        assert_eq!(status.send_window, [1, 10]);
    }

    #[test]
    fn unchanged_state_reuses_bundle() {
        let p = pair();
        p.client.submit(&p.server_key.id(), "mail", b"x").unwrap();

        let first = p.client.generate(&p.server_key).unwrap();
        let second = p.client.generate(&p.server_key).unwrap();
        assert_eq!(first.bundle_id, second.bundle_id);
        assert!(second.retransmission);
        assert_eq!(bytes(&first), bytes(&second));

        p.client.submit(&p.server_key.id(), "mail", b"y").unwrap();
        let third = p.client.generate(&p.server_key).unwrap();
        assert_ne!(third.bundle_id, first.bundle_id);
        assert_eq!(third.counter, 1);
    }

    #[test]
    fn lost_outbox_copy_is_reencrypted_under_same_id() {
        let p = pair();
        p.client.submit(&p.server_key.id(), "mail", b"x").unwrap();
        let first = p.client.generate(&p.server_key).unwrap();
        fs::remove_file(&first.path).unwrap();

        let again = p.client.generate(&p.server_key).unwrap();
        assert_eq!(again.bundle_id, first.bundle_id);
        assert!(again.path.exists());
        assert!(matches!(
            p.server.receive(&bytes(&again)).outcome,
            ReceiveOutcome::Applied { counter: 0, new_adus: 1 }
        ));
    }

    #[test]
    fn duplicate_delivery_is_stale() {
        let p = pair();
        p.client.submit(&p.server_key.id(), "mail", b"x").unwrap();
        let b = p.client.generate(&p.server_key).unwrap();

        assert!(matches!(p.server.receive(&bytes(&b)).outcome, ReceiveOutcome::Applied { .. }));
        assert_eq!(p.server.receive(&bytes(&b)).outcome, ReceiveOutcome::Stale { counter: 0 });
        assert!(p.server.violations().is_empty());
    }

    #[test]
    fn out_of_window_counter_is_flagged() {
        let p = pair_with(20, 3, 1_000_000);
        let mut minted = Vec::new();
        for i in 0..4u8 {
            p.client.submit(&p.server_key.id(), "mail", &[i]).unwrap();
            minted.push(p.client.generate(&p.server_key).unwrap());
        }

        assert_eq!(p.server.receive(&bytes(&minted[3])).outcome, ReceiveOutcome::Invalid { counter: 3 });
        assert_eq!(p.server.violations().len(), 1);

        // Bundles are cumulative: counter 2 carries ADUs 1..=3.
        assert_eq!(
            p.server.receive(&bytes(&minted[2])).outcome,
            ReceiveOutcome::Applied { counter: 2, new_adus: 3 }
        );
        assert_eq!(p.server.receive(&bytes(&minted[0])).outcome, ReceiveOutcome::Stale { counter: 0 });
        assert_eq!(
            p.server.receive(&bytes(&minted[3])).outcome,
            ReceiveOutcome::Applied { counter: 3, new_adus: 1 }
        );
    }

    #[test]
    fn bundle_for_someone_else_is_rejected() {
        let p = pair();
        let tmp = tempfile::tempdir().unwrap();
        let stranger = engine(
            tmp.path(),
            Arc::new(Identity::generate()),
            Direction::Downstream,
            None,
            10,
            1_000_000,
            Arc::new(NullConsumer),
        );
        p.client.submit(&p.server_key.id(), "mail", b"x").unwrap();
        let b = p.client.generate(&p.server_key).unwrap();

        let receipt = stranger.receive(&bytes(&b));
        assert!(matches!(
            receipt.outcome,
            ReceiveOutcome::Rejected { fault: BundleFault::AuthenticationFailure, .. }
        ));
        assert!(receipt.peer.is_none());
    }

    #[test]
    fn client_accepts_only_its_server() {
        let p = pair();
        let tmp = tempfile::tempdir().unwrap();
        let impostor = engine(
            tmp.path(),
            Arc::new(Identity::generate()),
            Direction::Downstream,
            None,
            10,
            1_000_000,
            Arc::new(NullConsumer),
        );
        let b = impostor.generate(&p.client_key).unwrap();
        assert!(matches!(
            p.client.receive(&bytes(&b)).outcome,
            ReceiveOutcome::Rejected { fault: BundleFault::AuthenticationFailure, .. }
        ));
    }

    #[test]
    fn garbage_is_a_protocol_violation() {
        let p = pair();
        assert!(matches!(
            p.server.receive(b"definitely not a bundle").outcome,
            ReceiveOutcome::Rejected { fault: BundleFault::ProtocolViolation, .. }
        ));
        assert_eq!(p.server.violations().len(), 1);
    }

    #[test]
    fn payload_budget_limits_inclusion() {
        let p = pair_with(10, 10, 10);
        for _ in 0..3 {
            p.client.submit(&p.server_key.id(), "mail", b"abcd").unwrap();
        }
        assert_eq!(p.client.generate(&p.server_key).unwrap().adu_count, 2);

        let q = pair_with(10, 10, 10);
        q.client.submit(&q.server_key.id(), "mail", &[0u8; 50]).unwrap();
        q.client.submit(&q.server_key.id(), "mail", b"small").unwrap();
        assert_eq!(q.client.generate(&q.server_key).unwrap().adu_count, 1);
    }

    #[test]
    fn apps_drain_in_configured_order() {
        let p = pair_with(10, 10, 8);
        p.client.submit(&p.server_key.id(), "echo", b"eeee").unwrap();
        p.client.submit(&p.server_key.id(), "mail", b"mmmm").unwrap();
        p.client.submit(&p.server_key.id(), "mail", b"mmmm").unwrap();

        let b = p.client.generate(&p.server_key).unwrap();
        p.server.receive(&bytes(&b));
        let mail = p
            .server
            .adus()
            .metadata(&p.client_key.id(), "mail", AduDirection::Recv)
            .unwrap();
        let echo = p
            .server
            .adus()
            .metadata(&p.client_key.id(), "echo", AduDirection::Recv)
            .unwrap();
        assert_eq!((mail.last_added_id, echo.last_added_id), (2, 0));
    }

    #[test]
    fn full_send_window_retransmits() {
        let p = pair_with(2, 10, 1_000_000);
        let mut last = None;
        for i in 0..3u8 {
            p.client.submit(&p.server_key.id(), "mail", &[i]).unwrap();
            last = Some(p.client.generate(&p.server_key).unwrap());
        }
        let last = last.unwrap();
        assert!(last.retransmission);
        assert_eq!(last.counter, 1);
        // Reports what the re-sent bundle carries, not the pending third ADU.
        assert_eq!(last.adu_count, 2);
    }

    fn block_recv_dir(p: &Pair, app: &str) -> PathBuf {
        let path = p
            ._tmp
            .path()
            .join("client")
            .join("adu")
            .join(p.server_key.id().as_str())
            .join("recv")
            .join(app);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"in the way").unwrap();
        path
    }

    #[test]
    fn failed_store_leaves_ack_unapplied_until_retry() {
        let p = pair();
        p.client.submit(&p.server_key.id(), "mail", b"up").unwrap();
        let b1 = p.client.generate(&p.server_key).unwrap();
        p.server.receive(&bytes(&b1));
        p.server.submit(&p.client_key.id(), "mail", b"down").unwrap();
        let s1 = p.server.generate(&p.client_key).unwrap();
        assert_eq!(s1.adu_count, 1);

        let blocker = block_recv_dir(&p, "mail");
        let receipt = p.client.receive(&bytes(&s1));
        assert!(matches!(
            receipt.outcome,
            ReceiveOutcome::Rejected { fault: BundleFault::TransientIo, .. }
        ));
        let status = p.client.status(&p.server_key.id()).unwrap();
        assert_eq!(status.send_window, [0, 9]);
        assert_eq!(status.unacknowledged, 1);
        assert_eq!(status.ack, None);
        assert_eq!(pending(&p.client, &p.server_key, "mail"), 1);
        assert!(b1.path.exists());

        fs::remove_file(&blocker).unwrap();
        assert_eq!(
            p.client.receive(&bytes(&s1)).outcome,
            ReceiveOutcome::Applied { counter: 0, new_adus: 1 }
        );
        let status = p.client.status(&p.server_key.id()).unwrap();
        assert_eq!(status.send_window, [1, 10]);
        assert_eq!(status.unacknowledged, 0);
        assert_eq!(status.ack, Some(s1.bundle_id.clone()));
        assert_eq!(pending(&p.client, &p.server_key, "mail"), 0);
        assert!(!b1.path.exists());
        assert!(p.client.violations().is_empty());
    }

    #[test]
    fn transient_failure_keeps_the_file_for_the_next_batch() {
        let p = pair();
        p.server.receive(&bytes(&p.client.generate(&p.server_key).unwrap()));
        p.server.submit(&p.client_key.id(), "echo", b"pong").unwrap();
        let s1 = p.server.generate(&p.client_key).unwrap();

        let inbox = p._tmp.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        let staged = inbox.join(&s1.bundle_id);
        fs::copy(&s1.path, &staged).unwrap();

        let blocker = block_recv_dir(&p, "echo");
        let receipts = p.client.process_batch(&[staged.clone()]);
        assert!(matches!(
            receipts[0].outcome,
            ReceiveOutcome::Rejected { fault: BundleFault::TransientIo, .. }
        ));
        assert!(staged.exists());

        fs::remove_file(&blocker).unwrap();
        let receipts = p.client.process_batch(&[staged.clone()]);
        assert_eq!(receipts[0].outcome, ReceiveOutcome::Applied { counter: 0, new_adus: 1 });
        assert!(!staged.exists());
    }

    #[test]
    fn ack_retires_bundles_left_behind_by_an_earlier_failure() {
        let p = pair();
        p.client.submit(&p.server_key.id(), "mail", b"up").unwrap();
        let b1 = p.client.generate(&p.server_key).unwrap();
        p.server.receive(&bytes(&b1));
        let s1 = p.server.generate(&p.client_key).unwrap();

        // The window moved but the ledger was never saved.
        let server_id = p.server_key.id();
        let mut windows = p.client.load_windows(&server_id).unwrap();
        windows.send.advance(0);
        p.client.windows.save(&server_id, &windows).unwrap();

        assert!(matches!(p.client.receive(&bytes(&s1)).outcome, ReceiveOutcome::Applied { .. }));
        let status = p.client.status(&server_id).unwrap();
        assert_eq!(status.unacknowledged, 0);
        assert_eq!(pending(&p.client, &p.server_key, "mail"), 0);
        assert!(!b1.path.exists());
    }

    #[test]
    fn batch_notifies_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let client_id = Arc::new(Identity::generate());
        let server_id = Arc::new(Identity::generate());
        let server_key = server_id.public();
        let client = engine(
            &tmp.path().join("c"),
            client_id,
            Direction::Upstream,
            None,
            10,
            1_000_000,
            Arc::new(NullConsumer),
        );
        let (consumer, mut events) = ChannelConsumer::new();
        let server = engine(
            &tmp.path().join("s"),
            server_id,
            Direction::Downstream,
            None,
            10,
            1_000_000,
            Arc::new(consumer),
        );

        client.submit(&server_key.id(), "mail", b"one").unwrap();
        client.submit(&server_key.id(), "mail", b"two").unwrap();
        let b = client.generate(&server_key).unwrap();

        let inbox = tmp.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        let good = inbox.join(&b.bundle_id);
        let bad = inbox.join("junk");
        fs::copy(&b.path, &good).unwrap();
        fs::write(&bad, b"junk").unwrap();

        let receipts = server.process_batch(&[good.clone(), bad.clone()]);
        assert_eq!(receipts.len(), 2);
        assert!(!good.exists() && !bad.exists());

        let mut adus = 0;
        let mut batches = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ConsumerEvent::Adu { .. } => adus += 1,
                ConsumerEvent::BatchComplete => batches += 1,
            }
        }
        assert_eq!((adus, batches), (2, 1));
    }
}
