use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::AppState;
use crate::error::ApiError;
use discret_core::access::{has_permission, Actor, AuditResult, Role};
use discret_shared::types::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: UserId,
    pub role: Role,
}

impl AuthContext {
    pub fn actor(&self) -> Actor {
        Actor::new(self.user_id, self.role)
    }
}

/// What the auth middleware leaves in request extensions. Token-less
/// requests pass through with `None`; the guards below decide per route.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaybeAuth(pub Option<AuthContext>);

impl MaybeAuth {
    pub fn actor(&self) -> Actor {
        self.0.map(|ctx| ctx.actor()).unwrap_or_default()
    }
}

pub fn issue_token(
    user_id: UserId,
    role: Role,
    secret: &str,
    ttl_seconds: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        exp: Utc::now().timestamp() + ttl_seconds,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn verify_token(token: &str, secret: &str) -> Result<AuthContext, ApiError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| ApiError::unauthorized("INVALID_TOKEN", "invalid or expired token"))?;

    let user_id: UserId = data
        .claims
        .sub
        .parse()
        .map_err(|_| ApiError::unauthorized("INVALID_TOKEN", "malformed subject"))?;
    let role: Role = data
        .claims
        .role
        .parse()
        .map_err(|_| ApiError::unauthorized("INVALID_TOKEN", "unknown role"))?;

    Ok(AuthContext { user_id, role })
}

/// Bearer-token middleware. A missing token is not an error here; a
/// present-but-bad token is.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = match bearer_token(&req) {
        Some(token) => MaybeAuth(Some(verify_token(&token, &state.config.jwt_secret)?)),
        None => MaybeAuth(None),
    };
    req.extensions_mut().insert(auth);
    Ok(next.run(req).await)
}

fn bearer_token<B>(req: &Request<B>) -> Option<String> {
    let header = req.headers().get(axum::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

pub fn require_auth(auth: &MaybeAuth) -> Result<AuthContext, ApiError> {
    auth.0
        .ok_or_else(|| ApiError::unauthorized("UNAUTHORIZED", "authentication required"))
}

/// Role-identity guard for routes that gate on who the caller is rather
/// than a derived permission; denials land in the audit log.
pub async fn require_role(
    state: &AppState,
    auth: &MaybeAuth,
    allowed: &[Role],
) -> Result<AuthContext, ApiError> {
    let ctx = require_auth(auth)?;

    if !allowed.contains(&ctx.role) {
        state
            .audit
            .record(
                Some(ctx.user_id),
                Some(ctx.role),
                "access.check",
                "role",
                Some(
                    allowed
                        .iter()
                        .map(Role::as_str)
                        .collect::<Vec<_>>()
                        .join(","),
                ),
                json!({}),
                AuditResult::Denied,
            )
            .await;
        return Err(ApiError::forbidden(format!(
            "role {} is not permitted here",
            ctx.role
        )));
    }

    Ok(ctx)
}

/// Permission guard; denials land in the audit log.
pub async fn require_permission(
    state: &AppState,
    auth: &MaybeAuth,
    permission: &str,
) -> Result<AuthContext, ApiError> {
    let Some(ctx) = auth.0 else {
        state
            .audit
            .record(
                None,
                None,
                "access.check",
                "permission",
                Some(permission.to_string()),
                json!({}),
                AuditResult::Denied,
            )
            .await;
        return Err(ApiError::unauthorized(
            "UNAUTHORIZED",
            "authentication required",
        ));
    };

    if !has_permission(ctx.role, permission) {
        state
            .audit
            .record(
                Some(ctx.user_id),
                Some(ctx.role),
                "access.check",
                "permission",
                Some(permission.to_string()),
                json!({}),
                AuditResult::Denied,
            )
            .await;
        return Err(ApiError::forbidden(format!(
            "role {} lacks {permission}",
            ctx.role
        )));
    }

    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-jwt-secret-32-bytes-long!!";

    #[test]
    fn test_token_roundtrip() {
        let user = UserId::new();
        let token = issue_token(user, Role::Driver, SECRET, 3600).unwrap();
        let ctx = verify_token(&token, SECRET).unwrap();
        assert_eq!(ctx.user_id, user);
        assert_eq!(ctx.role, Role::Driver);
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue_token(UserId::new(), Role::Customer, SECRET, -120).unwrap();
        let err = verify_token(&token, SECRET).unwrap_err();
        assert_eq!(err.code, "INVALID_TOKEN");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token(UserId::new(), Role::Admin, SECRET, 3600).unwrap();
        assert!(verify_token(&token, "other-secret-that-is-long-enough!!").is_err());
    }
}
