//! bundle-api — HTTP view of a running bundle server.
//! Operators read status, peers, and violations; consuming applications
//! read and delete inbound ADUs and enqueue outbound ones.

pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Largest ADU accepted over HTTP.
pub const MAX_ADU_BODY: usize = 64 * 1024 * 1024;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/peers", get(handlers::handle_peers))
        .route("/violations", get(handlers::handle_violations))
        .route(
            "/adus/{peer}/{app}",
            get(handlers::handle_list_adus)
                .post(handlers::handle_enqueue_adu)
                .layer(DefaultBodyLimit::max(MAX_ADU_BODY)),
        )
        .route("/adus/{peer}/{app}/delete/{id}", post(handlers::handle_delete_adus))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let mut shutdown = state.shutdown_tx.subscribe();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
