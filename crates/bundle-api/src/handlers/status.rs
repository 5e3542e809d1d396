//! /status, /peers, /violations, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use bundle_services::{PeerStatus, Violation};

use super::{blocking, internal, ApiError, ApiState};

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub public_identity: String,
    pub exchange_addr: String,
    pub uptime_secs: u64,
    pub peers_known: usize,
    pub violations: usize,
    pub clients: Vec<PeerStatus>,
}

pub async fn handle_status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, ApiError> {
    let server = state.server.clone();
    let clients = blocking(move || {
        server
            .peers()
            .list()
            .into_iter()
            .map(|(id, _)| server.engine().status(&id).map_err(internal))
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;

    let local = state.server.engine().local();
    Ok(Json(StatusResponse {
        id: local.id().to_string(),
        public_identity: local.to_hex(),
        exchange_addr: state.exchange_addr.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        peers_known: state.server.peers().len(),
        violations: state.server.engine().violations().len(),
        clients,
    }))
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub public_identity: String,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Transport that last carried this client's bundles, if any.
    pub transport: Option<String>,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    let peers = state
        .server
        .peers()
        .list()
        .into_iter()
        .map(|(id, record)| PeerInfo {
            transport: state.server.routes().transport_of(&id),
            id: id.to_string(),
            public_identity: record.identity.to_hex(),
            first_seen: record.first_seen,
            last_seen: record.last_seen,
        })
        .collect();

    Json(PeersResponse { peers })
}

// ── /violations ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ViolationsResponse {
    pub violations: Vec<Violation>,
}

pub async fn handle_violations(State(state): State<ApiState>) -> Json<ViolationsResponse> {
    Json(ViolationsResponse {
        violations: state.server.engine().violations().recent(),
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
