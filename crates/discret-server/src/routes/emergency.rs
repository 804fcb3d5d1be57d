use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::{require_permission, MaybeAuth};
use crate::error::{ok, ApiError, RequestId};
use discret_core::emergency::{AccelReading, EmergencyContact};
use discret_shared::geo::RawCoordinates;
use discret_shared::types::{DeliveryId, UserId};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/panic", post(panic_button))
        .route("/accelerometer", post(accelerometer))
        .route("/", get(list))
        .route("/active/{driver_id}", get(active))
        .route("/contacts/{driver_id}", post(set_contacts).get(contacts))
        .route("/{id}", get(get_emergency))
        .route("/{id}/acknowledge", post(acknowledge))
        .route("/{id}/resolve", post(resolve))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PanicRequest {
    driver_id: UserId,
    latitude: f64,
    longitude: f64,
    delivery_id: Option<DeliveryId>,
}

async fn panic_button(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<PanicRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "write:emergency").await?;
    let location = RawCoordinates::new(req.latitude, req.longitude)?;
    let record = state
        .emergency
        .panic(ctx.actor(), req.driver_id, location, req.delivery_id)
        .await;
    Ok(ok(&request_id, record))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccelerometerRequest {
    driver_id: UserId,
    x: f64,
    y: f64,
    z: f64,
    latitude: f64,
    longitude: f64,
    delivery_id: Option<DeliveryId>,
}

async fn accelerometer(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<AccelerometerRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "write:emergency").await?;
    let location = RawCoordinates::new(req.latitude, req.longitude)?;
    let reading = AccelReading {
        x: req.x,
        y: req.y,
        z: req.z,
        t: Utc::now(),
    };
    let record = state
        .emergency
        .accelerometer(ctx.actor(), req.driver_id, reading, location, req.delivery_id)
        .await;
    Ok(ok(
        &request_id,
        json!({"triggered": record.is_some(), "emergency": record}),
    ))
}

async fn get_emergency(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "read:emergency").await?;
    let record = state
        .emergency
        .get(ctx.actor(), id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("emergency {id} not found")))?;
    Ok(ok(&request_id, record))
}

async fn active(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(driver_id): Path<UserId>,
) -> Result<Response, ApiError> {
    require_permission(&state, &auth, "read:emergency").await?;
    let record = state.emergency.active_for(driver_id).await;
    Ok(ok(&request_id, json!({"active": record})))
}

async fn list(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Response, ApiError> {
    require_permission(&state, &auth, "read:emergency").await?;
    Ok(ok(&request_id, state.emergency.list().await))
}

async fn acknowledge(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "write:emergency").await?;
    let record = state
        .emergency
        .acknowledge(ctx.actor(), id, ctx.user_id)
        .await?;
    Ok(ok(&request_id, record))
}

async fn resolve(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "write:emergency").await?;
    let record = state.emergency.resolve(ctx.actor(), id, ctx.user_id).await?;
    Ok(ok(&request_id, record))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactsRequest {
    contacts: Vec<EmergencyContact>,
}

async fn set_contacts(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(driver_id): Path<UserId>,
    Json(req): Json<ContactsRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "write:emergency").await?;
    state
        .emergency
        .set_contacts(ctx.actor(), driver_id, req.contacts)
        .await;
    Ok(ok(&request_id, json!({"updated": true})))
}

async fn contacts(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(driver_id): Path<UserId>,
) -> Result<Response, ApiError> {
    require_permission(&state, &auth, "read:emergency").await?;
    Ok(ok(&request_id, state.emergency.contacts(driver_id).await))
}
