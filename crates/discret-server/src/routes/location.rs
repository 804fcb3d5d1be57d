use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::AppState;
use crate::error::{ok, ApiError, RequestId};
use discret_core::obfuscate;
use discret_shared::geo::{self, RawCoordinates};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/obfuscate", post(obfuscate_fix))
        .route("/zones/{id}/center", get(zone_center))
}

#[derive(Deserialize)]
struct ObfuscateRequest {
    latitude: f64,
    longitude: f64,
    resolution: Option<u8>,
}

async fn obfuscate_fix(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<ObfuscateRequest>,
) -> Result<Response, ApiError> {
    let raw = RawCoordinates::new(req.latitude, req.longitude)?;
    let resolution = req.resolution.unwrap_or(state.config.default_resolution());
    let location = obfuscate::obfuscate(&raw, resolution)?;
    Ok(ok(&request_id, location))
}

async fn zone_center(
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let center = geo::zone_center(&id)?;
    Ok(ok(
        &request_id,
        json!({
            "zone_id": id,
            "latitude": center.latitude,
            "longitude": center.longitude,
        }),
    ))
}
