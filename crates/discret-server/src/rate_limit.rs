use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::ConnectInfo, http::Request, middleware::Next, response::Response};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ApiError;

#[derive(Debug)]
struct Window {
    hits: u32,
    opened: Instant,
}

/// Per-IP fixed window sized from RATE_LIMIT_MAX_REQUESTS per
/// RATE_LIMIT_WINDOW_MS. Windows reset lazily on the first request past
/// their boundary, same as the notification send counters.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<IpAddr, Window>>>,
    max_hits: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_hits: max_requests,
            window: Duration::from_millis(window_ms),
        }
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(ip).or_insert(Window {
            hits: 0,
            opened: now,
        });

        if now.duration_since(window.opened) >= self.window {
            window.hits = 0;
            window.opened = now;
        }

        if window.hits >= self.max_hits {
            return false;
        }
        window.hits += 1;
        true
    }

    /// Drop windows that have not seen traffic for `max_idle`.
    pub async fn purge_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, w| now.duration_since(w.opened) < max_idle);
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(ip) = client_ip(&req) {
        if !limiter.check(ip).await {
            warn!(ip = %ip, "rate limit exceeded");
            return Err(ApiError::rate_limited("too many requests"));
        }
    }

    Ok(next.run(req).await)
}

/// Peer address when the listener gives us one, proxy headers otherwise.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(peer)) = req
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
    {
        return Some(peer.ip());
    }

    for header in ["x-forwarded-for", "x-real-ip"] {
        let Some(value) = req.headers().get(header).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        if let Some(ip) = value.split(',').find_map(|part| part.trim().parse().ok()) {
            return Some(ip);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_caps_requests() {
        let limiter = RateLimiter::new(5, 60_000);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.check(ip).await);
        }

        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn test_window_resets_after_boundary() {
        let limiter = RateLimiter::new(2, 10);
        let ip: IpAddr = "127.0.0.2".parse().unwrap();

        assert!(limiter.check(ip).await);
        assert!(limiter.check(ip).await);
        assert!(!limiter.check(ip).await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.check(ip).await);
    }

    #[tokio::test]
    async fn test_ips_counted_separately() {
        let limiter = RateLimiter::new(2, 60_000);
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(ip1).await);
        assert!(limiter.check(ip1).await);
        assert!(!limiter.check(ip1).await);

        assert!(limiter.check(ip2).await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(5, 60_000);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.check(ip).await);

        limiter.purge_stale(Duration::ZERO).await;

        let windows = limiter.windows.lock().await;
        assert!(windows.is_empty());
    }

    #[test]
    fn test_client_ip_from_forwarded_header() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_absent() {
        let req = Request::builder().body(()).unwrap();
        assert_eq!(client_ip(&req), None);
    }
}
