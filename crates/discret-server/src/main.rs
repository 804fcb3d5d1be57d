mod api;
mod auth;
mod config;
mod error;
mod rate_limit;
mod routes;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::AppConfig;
use crate::rate_limit::RateLimiter;
use discret_core::access::AuditLog;
use discret_core::codes::CodeGenerator;
use discret_core::emergency::EmergencyService;
use discret_core::monitor::SecurityMonitor;
use discret_core::notify::NotificationService;
use discret_core::realtime::Broadcaster;
use discret_core::verify::{VerificationService, VerifyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,discret_server=debug")),
        )
        .init();

    info!("Starting Discret core v{}", env!("CARGO_PKG_VERSION"));

    let config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            std::process::exit(1);
        }
    };
    info!(
        env = %config.rust_env,
        addr = %config.bind_addr(),
        zone_resolution = config.default_resolution(),
        retention_audit_days = config.retention_days_audit,
        "Configuration loaded"
    );

    let config = Arc::new(config);
    let audit = Arc::new(AuditLog::new());
    let broadcaster = Arc::new(Broadcaster::new());
    let notifier = Arc::new(NotificationService::new(
        config.encryption_key.as_bytes(),
        audit.clone(),
    ));

    let verifier = Arc::new(VerificationService::new(
        config.encryption_key.as_bytes(),
        config.hmac_secret.as_bytes(),
        VerifyConfig {
            otp_ttl_secs: config.otp_ttl_seconds,
            otp_length: config.otp_length,
            max_otp_attempts: config.code_max_attempts,
            ..VerifyConfig::default()
        },
        audit.clone(),
        broadcaster.clone(),
    ));

    let monitor = Arc::new(SecurityMonitor::new(audit.clone(), broadcaster.clone()));
    let emergency = Arc::new(EmergencyService::new(
        audit.clone(),
        notifier.clone(),
        broadcaster.clone(),
    ));
    let codes = Arc::new(CodeGenerator::new(
        config.hmac_secret.as_bytes(),
        TimeDelta::minutes(config.code_ttl_minutes),
    ));

    let rate_limiter = RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window_ms);

    // Rate limiter cleanup every 5 min, evict buckets idle >10 min
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(std::time::Duration::from_secs(600)).await;
        }
    });

    // Quiet-driver sweep every minute
    let mon = monitor.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            mon.sweep_communication_loss().await;
        }
    });

    let state = AppState {
        config: config.clone(),
        audit,
        broadcaster,
        verifier,
        monitor,
        emergency,
        notifier,
        codes,
        rate_limiter,
    };

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {}: {e}", config.bind_addr()))?;

    tokio::select! {
        result = api::serve(state, addr) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
