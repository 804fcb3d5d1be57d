use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::{require_auth, MaybeAuth};
use crate::error::{ok, ApiError, RequestId};
use discret_core::notify::{Channel, Priority, UserPreferences};
use discret_shared::types::UserId;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/send", post(send))
        .route("/preferences", put(set_preferences).get(preferences))
        .route("/user/{user_id}", get(list_for_user))
        .route("/{id}", get(get_notification))
        .route("/{id}/delivered", post(mark_delivered))
        .route("/{id}/read", post(mark_read))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    recipient_id: UserId,
    channel: Channel,
    template_id: String,
    content: String,
    priority: Option<Priority>,
}

async fn send(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<SendRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    let record = state
        .notifier
        .send(
            ctx.actor(),
            req.recipient_id,
            req.channel,
            &req.template_id,
            &req.content,
            req.priority.unwrap_or_default(),
        )
        .await?;
    Ok(ok(&request_id, record))
}

async fn get_notification(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_auth(&auth)?;
    let record = state
        .notifier
        .get(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("notification {id} not found")))?;
    Ok(ok(&request_id, record))
}

async fn list_for_user(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(user_id): Path<UserId>,
) -> Result<Response, ApiError> {
    require_auth(&auth)?;
    Ok(ok(&request_id, state.notifier.list_for_user(user_id).await))
}

async fn set_preferences(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(prefs): Json<UserPreferences>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    state
        .notifier
        .set_preferences(ctx.actor(), ctx.user_id, prefs)
        .await;
    Ok(ok(&request_id, state.notifier.preferences(ctx.user_id).await))
}

async fn preferences(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    Ok(ok(&request_id, state.notifier.preferences(ctx.user_id).await))
}

async fn mark_delivered(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_auth(&auth)?;
    let record = state.notifier.mark_delivered(id).await?;
    Ok(ok(&request_id, record))
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_auth(&auth)?;
    let record = state.notifier.mark_read(id).await?;
    Ok(ok(&request_id, record))
}
