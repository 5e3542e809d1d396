//! /adus handlers — the consuming application's window onto the ADU store.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use serde::Serialize;

use bundle_services::{AduDirection, AduError};

use super::{blocking, internal, parse_peer, ApiError, ApiState};

fn store_error(e: AduError) -> ApiError {
    match e {
        AduError::InvalidAppId(app) => (StatusCode::BAD_REQUEST, format!("invalid application id {app:?}")),
        AduError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        AduError::Io(e) => internal(format!("{e:#}")),
    }
}

// ── /adus/{peer}/{app} (GET) ──────────────────────────────────────────────────

#[derive(Serialize)]
pub struct AdusResponse {
    pub peer: String,
    pub app_id: String,
    pub last_delivered_id: u64,
    pub adus: Vec<AduJson>,
}

#[derive(Serialize)]
pub struct AduJson {
    pub adu_id: u64,
    pub size: usize,
    pub data_hex: String,
}

pub async fn handle_list_adus(
    State(state): State<ApiState>,
    Path((peer, app)): Path<(String, String)>,
) -> Result<Json<AdusResponse>, ApiError> {
    let peer_id = parse_peer(&peer)?;
    let adus = state.server.engine().adus().clone();
    let app_id = app.clone();

    let (meta, stored) = blocking(move || {
        let meta = adus
            .metadata(&peer_id, &app_id, AduDirection::Recv)
            .map_err(store_error)?;
        let stored = adus
            .list_from(&peer_id, &app_id, AduDirection::Recv, 1)
            .map_err(store_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;
        Ok((meta, stored))
    })
    .await?;

    Ok(Json(AdusResponse {
        peer,
        app_id: app,
        last_delivered_id: meta.last_delivered_id,
        adus: stored
            .into_iter()
            .map(|a| AduJson {
                adu_id: a.adu_id,
                size: a.data.len(),
                data_hex: hex::encode(&a.data),
            })
            .collect(),
    }))
}

// ── /adus/{peer}/{app} (POST) ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EnqueueResponse {
    pub peer: String,
    pub app_id: String,
    pub adu_id: u64,
}

pub async fn handle_enqueue_adu(
    State(state): State<ApiState>,
    Path((peer, app)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let peer_id = parse_peer(&peer)?;
    if !state.server.peers().contains(&peer_id) {
        return Err((StatusCode::NOT_FOUND, format!("unknown client {peer}")));
    }
    let adus = state.server.engine().adus().clone();
    let app_id = app.clone();
    let adu_id = blocking(move || adus.append(&peer_id, &app_id, &body).map_err(store_error)).await?;

    tracing::info!(peer = %peer, app_id = %app, adu_id, "ADU enqueued via API");
    Ok(Json(EnqueueResponse {
        peer,
        app_id: app,
        adu_id,
    }))
}

// ── /adus/{peer}/{app}/delete/{id} (POST) ─────────────────────────────────────

#[derive(Serialize)]
pub struct DeleteResponse {
    pub peer: String,
    pub app_id: String,
    pub up_to: u64,
    pub removed: usize,
}

pub async fn handle_delete_adus(
    State(state): State<ApiState>,
    Path((peer, app, up_to)): Path<(String, String, u64)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let peer_id = parse_peer(&peer)?;
    let adus = state.server.engine().adus().clone();
    let app_id = app.clone();

    let removed = blocking(move || {
        adus.mark_progress(&peer_id, &app_id, AduDirection::Recv, up_to)
            .map_err(store_error)?;
        adus.delete_up_to(&peer_id, &app_id, AduDirection::Recv, up_to)
            .map_err(store_error)
    })
    .await?;

    Ok(Json(DeleteResponse {
        peer,
        app_id: app,
        up_to,
        removed,
    }))
}
