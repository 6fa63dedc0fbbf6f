//! Per-IP limit on stream resolutions.
//!
//! Every resolution costs several provider round-trips, so it is throttled
//! with a fixed-window counter per client. Proxy traffic is not limited:
//! a player issues one request per segment.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::state::AppState;

#[derive(Clone, Debug)]
pub struct ResolveLimiter {
    /// Per client: (resolutions in window, window start)
    windows: Arc<DashMap<String, (u32, Instant)>>,
    limit: u32,
    window: Duration,
}

impl ResolveLimiter {
    pub fn new(resolutions_per_minute: u32) -> Self {
        Self::with_window(resolutions_per_minute, Duration::from_secs(60))
    }

    fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            limit,
            window,
        }
    }

    /// Count one resolution for `client`; `false` once over the limit.
    fn admit(&self, client: &str) -> bool {
        let mut entry = self
            .windows
            .entry(client.to_string())
            .or_insert((0, Instant::now()));
        let (count, started) = entry.value_mut();

        if started.elapsed() >= self.window {
            *count = 0;
            *started = Instant::now();
        }
        *count += 1;
        *count <= self.limit
    }

    /// Forget clients whose window has closed.
    pub fn cleanup(&self) {
        self.windows
            .retain(|_, (_, started)| started.elapsed() < self.window);
    }
}

/// First `X-Forwarded-For` hop, or "unknown" when not behind a proxy.
fn client_key(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

pub async fn limit_resolutions(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(ref limiter) = state.limiter {
        let client = client_key(&req);
        if !limiter.admit(&client) {
            warn!("Resolution rate limit exceeded for {}", client);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many stream resolutions, slow down\n",
            )
                .into_response();
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit() {
        let limiter = ResolveLimiter::new(3);
        assert!(limiter.admit("1.1.1.1"));
        assert!(limiter.admit("1.1.1.1"));
        assert!(limiter.admit("1.1.1.1"));
        assert!(!limiter.admit("1.1.1.1"));
    }

    #[test]
    fn clients_are_independent() {
        let limiter = ResolveLimiter::new(1);
        assert!(limiter.admit("a"));
        assert!(!limiter.admit("a"));
        assert!(limiter.admit("b"));
    }

    #[test]
    fn window_reopens() {
        let limiter = ResolveLimiter::with_window(1, Duration::from_millis(1));
        assert!(limiter.admit("a"));
        assert!(!limiter.admit("a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.admit("a"));
    }

    #[test]
    fn cleanup_drops_closed_windows() {
        let limiter = ResolveLimiter::with_window(5, Duration::from_millis(1));
        limiter.admit("a");
        limiter.admit("b");
        std::thread::sleep(Duration::from_millis(5));
        limiter.cleanup();
        assert!(limiter.windows.is_empty());
    }
}
