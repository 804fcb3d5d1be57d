use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::AppState;
use crate::auth::{require_permission, MaybeAuth};
use crate::error::{ok, ApiError, RequestId};
use discret_core::access::{permissions, AuditResult, Role};
use discret_shared::types::UserId;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/permissions", get(list_permissions))
        .route("/audit", get(read_audit))
}

const ALL_ROLES: [Role; 6] = [
    Role::Customer,
    Role::Driver,
    Role::Dispatcher,
    Role::SecurityOfficer,
    Role::Admin,
    Role::System,
];

async fn list_permissions(
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
) -> Response {
    match auth.0 {
        Some(ctx) => ok(
            &request_id,
            json!({"role": ctx.role, "permissions": permissions(ctx.role)}),
        ),
        None => {
            let matrix: serde_json::Map<String, serde_json::Value> = ALL_ROLES
                .iter()
                .map(|r| (r.to_string(), json!(permissions(*r))))
                .collect();
            ok(&request_id, json!({"matrix": matrix}))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditQuery {
    actor_id: Option<UserId>,
    resource_type: Option<String>,
    limit: Option<usize>,
}

/// Reading the audit log is itself a sensitive read, so it is recorded.
async fn read_audit(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(auth): Extension<MaybeAuth>,
    Query(query): Query<AuditQuery>,
) -> Result<Response, ApiError> {
    let ctx = require_permission(&state, &auth, "read:audit").await?;

    let limit = query.limit.unwrap_or(100).min(1000);
    let entries = state
        .audit
        .query(query.actor_id, query.resource_type.as_deref(), limit)
        .await;

    state
        .audit
        .record(
            Some(ctx.user_id),
            Some(ctx.role),
            "audit.read",
            "audit",
            None,
            json!({"returned": entries.len()}),
            AuditResult::Success,
        )
        .await;

    Ok(ok(&request_id, entries))
}
