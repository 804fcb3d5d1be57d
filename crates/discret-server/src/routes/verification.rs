use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::api::AppState;
use crate::auth::{require_auth, MaybeAuth};
use crate::error::{ok, ApiError, RequestId};
use discret_core::verify::{PhotoMeta, VerificationMethod};
use discret_shared::types::{DeliveryId, UserId};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/initialize", post(initialize))
        .route("/otp/generate", post(otp_generate))
        .route("/otp/verify", post(otp_verify))
        .route("/photo", post(store_photo))
        .route("/signature", post(store_signature))
        .route("/geofence", post(geofence))
        .route("/fallback", post(fallback))
        .route("/status/{delivery_id}", get(status))
        .route("/pending/{delivery_id}", get(pending))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeRequest {
    delivery_id: DeliveryId,
    required: Vec<VerificationMethod>,
}

async fn initialize(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<InitializeRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    if req.required.is_empty() {
        return Err(ApiError::validation("required methods must be non-empty"));
    }
    let verification = state
        .verifier
        .initialize(ctx.actor(), req.delivery_id, req.required)
        .await;
    Ok(ok(&request_id, verification))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtpGenerateRequest {
    delivery_id: DeliveryId,
    recipient_id: UserId,
}

async fn otp_generate(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<OtpGenerateRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    let (otp, expires_at) = state
        .verifier
        .generate_otp(ctx.actor(), req.delivery_id, req.recipient_id)
        .await;
    Ok(ok(&request_id, json!({"otp": otp, "expires_at": expires_at})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtpVerifyRequest {
    delivery_id: DeliveryId,
    token: String,
}

async fn otp_verify(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<OtpVerifyRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        state.verifier.verify_otp(ctx.actor(), req.delivery_id, &req.token),
    )
    .await
    .map_err(|_| ApiError::internal("otp verification timed out"))?;
    // Verification outcomes are success-shaped, not HTTP errors.
    Ok(ok(&request_id, outcome))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhotoRequest {
    delivery_id: DeliveryId,
    photo_base64: String,
    width: u32,
    height: u32,
    mime: String,
}

async fn store_photo(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<PhotoRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    let bytes = STANDARD
        .decode(&req.photo_base64)
        .map_err(|_| ApiError::validation("photoBase64 is not valid base64"))?;
    let meta = PhotoMeta {
        width: req.width,
        height: req.height,
        mime: req.mime,
        bytes: bytes.len(),
    };
    let photo = state
        .verifier
        .store_photo(ctx.actor(), req.delivery_id, &bytes, meta)
        .await?;
    Ok(ok(
        &request_id,
        json!({"id": photo.id, "captured_at": photo.captured_at, "bytes": photo.meta.bytes}),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureRequest {
    delivery_id: DeliveryId,
    data_base64: String,
    signer_name: Option<String>,
}

async fn store_signature(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<SignatureRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    let data = STANDARD
        .decode(&req.data_base64)
        .map_err(|_| ApiError::validation("dataBase64 is not valid base64"))?;
    let signature = state
        .verifier
        .store_signature(ctx.actor(), req.delivery_id, &data, req.signer_name.as_deref())
        .await?;
    Ok(ok(
        &request_id,
        json!({"id": signature.id, "sig_hash": signature.sig_hash, "captured_at": signature.captured_at}),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Coordinates {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeofenceRequest {
    delivery_id: DeliveryId,
    driver_location: Coordinates,
    delivery_location: Coordinates,
    radius_m: Option<f64>,
}

async fn geofence(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<GeofenceRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    let driver =
        discret_shared::geo::RawCoordinates::new(req.driver_location.latitude, req.driver_location.longitude)?;
    let delivery = discret_shared::geo::RawCoordinates::new(
        req.delivery_location.latitude,
        req.delivery_location.longitude,
    )?;
    let outcome = state
        .verifier
        .verify_geofence(ctx.actor(), req.delivery_id, driver, delivery, req.radius_m)
        .await;
    Ok(ok(&request_id, outcome))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FallbackRequest {
    delivery_id: DeliveryId,
    code: String,
}

async fn fallback(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<FallbackRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    let outcome = state
        .verifier
        .fallback(ctx.actor(), req.delivery_id, &req.code)
        .await;
    Ok(ok(&request_id, outcome))
}

async fn status(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(delivery_id): Path<DeliveryId>,
) -> Result<Response, ApiError> {
    let verification = state
        .verifier
        .status(delivery_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no verification for {delivery_id}")))?;
    Ok(ok(&request_id, verification))
}

async fn pending(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(delivery_id): Path<DeliveryId>,
) -> Result<Response, ApiError> {
    let pending = state
        .verifier
        .pending(delivery_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no verification for {delivery_id}")))?;
    Ok(ok(&request_id, json!({"pending": pending})))
}
