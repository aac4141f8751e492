use crate::AppState;
use crate::error::AppError;
use crate::validation::{self, Lookup};

use altfinder_db::Sighting;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_macros::debug_handler;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
pub(crate) struct LoginRequest {
    uuid: String,
    ip: String,
    server: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct SightingsResponse {
    key: String,
    /// Store clock when the response was built, for "seen N ago" rendering
    now: i64,
    sightings: Vec<Sighting>,
}

#[derive(Serialize)]
pub(crate) struct AltsResponse {
    uuid: String,
    alts: Vec<Sighting>,
}

#[derive(Serialize)]
pub(crate) struct RemoveResponse {
    key: String,
    removed: u64,
}

#[debug_handler]
pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let player_id = validation::parse_player_id(&payload.uuid)?;
    let ip = validation::parse_ip(&payload.ip)?;
    let server = payload.server.unwrap_or_else(|| state.server_name.clone());
    validation::validate_server(&server)?;

    if state.ignored.contains(&Lookup::Ip(ip.clone()))
        || state.ignored.contains(&Lookup::Player(player_id))
    {
        debug!(%player_id, %ip, "ignored login");
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    let sighting = state.api.add(player_id, &ip, &server).await?;
    Ok((StatusCode::OK, Json(sighting)).into_response())
}

#[debug_handler]
pub(crate) async fn sightings(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let lookup = Lookup::parse(&key)?;

    let mut sightings: Vec<Sighting> = state.api.get_lookup(&lookup).await.into_iter().collect();
    sightings.sort_by(|a, b| a.created.cmp(&b.created).then(a.ip.cmp(&b.ip)));
    let now = state.api.store_time().await;

    Ok(Json(SightingsResponse {
        key: lookup.key(),
        now,
        sightings,
    }))
}

#[debug_handler]
pub(crate) async fn alts(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let player_id = validation::parse_player_id(&uuid)?;
    let alts = state.api.find_alts(player_id).await;

    Ok(Json(AltsResponse {
        uuid: player_id.to_string(),
        alts,
    }))
}

#[debug_handler]
pub(crate) async fn remove(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let lookup = Lookup::parse(&key)?;
    let removed = state.api.remove(&lookup.key()).await?;

    Ok(Json(RemoveResponse {
        key: lookup.key(),
        removed,
    }))
}
