use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::Deserialize;

use crate::api::AppState;
use crate::auth::{require_auth, MaybeAuth};
use crate::error::{ok, ApiError, RequestId};
use discret_core::access::AuditResult;
use discret_core::codes::CodeTheme;
use discret_shared::types::DeliveryId;

pub fn router() -> Router<AppState> {
    Router::new().route("/generate", post(generate))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    delivery_id: DeliveryId,
    theme: Option<String>,
}

async fn generate(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let ctx = require_auth(&auth)?;
    let theme = CodeTheme::parse(req.theme.as_deref().unwrap_or_default());
    let code = state.codes.generate(req.delivery_id, ctx.user_id, theme);

    state
        .audit
        .record(
            Some(ctx.user_id),
            Some(ctx.role),
            "code.generate",
            "delivery_code",
            Some(code.id.to_string()),
            serde_json::json!({"delivery_id": req.delivery_id, "theme": theme}),
            AuditResult::Success,
        )
        .await;

    Ok(ok(&request_id, code))
}
