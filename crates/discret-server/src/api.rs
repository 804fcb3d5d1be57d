use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, Method, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::error::{RequestId, REQUEST_ID_HEADER};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::routes;
use discret_core::access::AuditLog;
use discret_core::codes::CodeGenerator;
use discret_core::emergency::EmergencyService;
use discret_core::monitor::SecurityMonitor;
use discret_core::notify::NotificationService;
use discret_core::realtime::Broadcaster;
use discret_core::verify::VerificationService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub audit: Arc<AuditLog>,
    pub broadcaster: Arc<Broadcaster>,
    pub verifier: Arc<VerificationService>,
    pub monitor: Arc<SecurityMonitor>,
    pub emergency: Arc<EmergencyService>,
    pub notifier: Arc<NotificationService>,
    pub codes: Arc<CodeGenerator>,
    pub rate_limiter: RateLimiter,
}

pub fn build_router(state: AppState) -> Router {
    let cors = match &state.config.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(
                origin
                    .parse::<HeaderValue>()
                    .unwrap_or_else(|_| HeaderValue::from_static("*")),
            )
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
            .allow_headers(Any),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
            .allow_headers(Any),
    };

    Router::new()
        .route("/health", get(health))
        .nest("/api/location", routes::location::router())
        .nest("/api/codes", routes::codes::router())
        .nest("/api/verification", routes::verification::router())
        .nest("/api/security", routes::security::router())
        .nest("/api/emergency", routes::emergency::router())
        .nest("/api/privacy", routes::privacy::router())
        .nest("/api/notifications", routes::notifications::router())
        .nest("/api/realtime", routes::realtime::router())
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(request_meta_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Stamp each request with a correlation id; echo it on the way out
/// unless the handler already did.
async fn request_meta_middleware(mut req: Request<Body>, next: Next) -> Response {
    let request_id = RequestId::fresh();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&request_id.0) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    response
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "discret-server",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API listening");
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
