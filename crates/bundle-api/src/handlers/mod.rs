//! HTTP API handlers — exposes server state as JSON.

pub mod adus;
pub mod status;

use std::time::Instant;

use axum::http::StatusCode;

use bundle_core::crypto::PeerId;
use bundle_services::ServerNode;

#[derive(Clone)]
pub struct ApiState {
    pub server: ServerNode,
    /// Address the exchange listener is bound to.
    pub exchange_addr: String,
    pub started_at: Instant,
    /// Shutdown broadcast sender — signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

type ApiError = (StatusCode, String);

/// Parse a 32-character hex peer id.
fn parse_peer(s: &str) -> Result<PeerId, ApiError> {
    PeerId::parse(s).ok_or((StatusCode::BAD_REQUEST, "peer must be a 32-character hex id".to_string()))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Run store access off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(internal)?
}

// Re-export handler functions for use in router setup.
pub use adus::{handle_delete_adus, handle_enqueue_adu, handle_list_adus};
pub use status::{handle_peers, handle_shutdown, handle_status, handle_violations};
