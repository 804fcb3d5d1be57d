use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::{require_auth, require_permission, require_role, MaybeAuth};
use crate::error::{ok, ApiError, RequestId};
use discret_core::access::Role;
use discret_core::monitor::{AlertFilter, ResolutionStatus, Severity};
use discret_core::obfuscate;
use discret_core::realtime::{Audience, RealtimeEvent};
use discret_shared::geo::RawCoordinates;
use discret_shared::types::{DeliveryId, UserId};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/location-update", post(location_update))
        .route("/expected-route", post(expected_route))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/alerts/{id}/resolve", post(resolve_alert))
        .route("/stats", get(stats))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationUpdateRequest {
    delivery_id: DeliveryId,
    driver_id: UserId,
    latitude: f64,
    longitude: f64,
    resolution: Option<u8>,
    vehicle_id: Option<String>,
}

/// Ingress for driver fixes: obfuscate once, then fan the zone-level view
/// to the anomaly detectors and the delivery room.
async fn location_update(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<LocationUpdateRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;

    let raw = RawCoordinates::new(req.latitude, req.longitude)?;
    let resolution = req.resolution.unwrap_or(state.config.default_resolution());
    let location = obfuscate::obfuscate(&raw, resolution)?;

    let alerts = state
        .monitor
        .process_location_update(
            ctx.actor(),
            req.delivery_id,
            req.driver_id,
            &location,
            req.vehicle_id,
        )
        .await;

    state
        .broadcaster
        .broadcast(RealtimeEvent::new(
            "delivery:location",
            json!({
                "delivery_id": req.delivery_id,
                "zone_id": location.zone_id,
                "approx_time": location.approx_time,
            }),
            Audience::delivery(req.delivery_id),
        ))
        .await;

    Ok(ok(
        &request_id,
        json!({"location": location, "alerts_raised": alerts.len()}),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpectedRouteRequest {
    delivery_id: DeliveryId,
    zone_sequence: Vec<String>,
}

/// Registering the expected zone sequence is a dispatch operation.
async fn expected_route(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<ExpectedRouteRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_role(
        &state,
        &auth,
        &[Role::Dispatcher, Role::Admin, Role::System],
    )
    .await?;
    if req.zone_sequence.is_empty() {
        return Err(ApiError::validation("zoneSequence must be non-empty"));
    }
    state
        .monitor
        .register_expected_route(ctx.actor(), req.delivery_id, req.zone_sequence)
        .await;
    Ok(ok(&request_id, json!({"registered": true})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertQuery {
    severity: Option<Severity>,
    #[serde(default)]
    unacknowledged_only: bool,
    delivery_id: Option<DeliveryId>,
}


async fn list_alerts(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Query(query): Query<AlertQuery>,
) -> Result<Response, ApiError> {
    require_permission(&state, &auth, "read:security_alert").await?;
    let alerts = state
        .monitor
        .alerts(&AlertFilter {
            severity: query.severity,
            unacknowledged_only: query.unacknowledged_only,
            delivery_id: query.delivery_id,
        })
        .await;
    Ok(ok(&request_id, alerts))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "write:security_alert").await?;
    let alert = state
        .monitor
        .acknowledge(ctx.actor(), id, ctx.user_id)
        .await?;
    Ok(ok(&request_id, alert))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    status: ResolutionStatus,
    notes: Option<String>,
}

async fn resolve_alert(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "write:security_alert").await?;
    let alert = state
        .monitor
        .resolve(ctx.actor(), id, ctx.user_id, req.status, req.notes)
        .await?;
    Ok(ok(&request_id, alert))
}

async fn stats(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Response, ApiError> {
    require_permission(&state, &auth, "read:security_alert").await?;
    Ok(ok(&request_id, state.monitor.stats().await))
}
