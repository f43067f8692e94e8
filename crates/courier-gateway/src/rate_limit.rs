use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

/// Refill rate (tokens per second) and bucket size.
#[derive(Debug, Clone, Copy)]
struct Limits {
    rate: f64,
    burst: f64,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    limits: Limits,
    available: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn full(limits: Limits) -> Self {
        Self {
            limits,
            available: limits.burst,
            refilled_at: Instant::now(),
        }
    }

    fn take(&mut self) -> bool {
        let now = Instant::now();
        let earned = now.duration_since(self.refilled_at).as_secs_f64() * self.limits.rate;
        self.available = (self.available + earned).min(self.limits.burst);
        self.refilled_at = now;

        let allowed = self.available >= 1.0;
        if allowed {
            self.available -= 1.0;
        }
        allowed
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.refilled_at)
    }
}

/// Shared limiter keyed by client address (HTTP) or any other key.
#[derive(Clone)]
pub struct RateLimiter<K = IpAddr> {
    buckets: Arc<Mutex<HashMap<K, TokenBucket>>>,
    limits: Limits,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            limits: Limits { rate, burst },
        }
    }

    pub async fn check(&self, key: K) -> bool {
        let limits = self.limits;
        self.buckets
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| TokenBucket::full(limits))
            .take()
    }

    /// Forget keys that have not been seen for `max_idle`.
    pub async fn purge_stale(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, bucket| bucket.idle_for(now) < max_idle);
        before - buckets.len()
    }
}

impl Default for RateLimiter<IpAddr> {
    /// 10 requests per second, bursts of 30.
    fn default() -> Self {
        Self::new(10.0, 30.0)
    }
}

/// Inbound envelope budget of one websocket connection. Owned by the
/// connection's reader, so no locking.
#[derive(Debug)]
pub struct MessageThrottle(TokenBucket);

impl MessageThrottle {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self(TokenBucket::full(Limits { rate, burst }))
    }

    pub fn allow(&mut self) -> bool {
        self.0.take()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(ip) = extract_client_ip(&req) else {
        return Ok(next.run(req).await);
    };
    if !limiter.check(ip).await {
        warn!(ip = %ip, path = %req.uri().path(), "Rate limit exceeded");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(next.run(req).await)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    let header_ip = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_then_reject() {
        let limiter = RateLimiter::new(0.01, 4.0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..4 {
            assert!(limiter.check(ip).await);
        }
        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter: RateLimiter<&'static str> = RateLimiter::new(10.0, 2.0);

        assert!(limiter.check("alice").await);
        assert!(limiter.check("alice").await);
        assert!(!limiter.check("alice").await);

        assert!(limiter.check("bob").await);
    }

    #[tokio::test]
    async fn test_idle_keys_are_purged() {
        let limiter = RateLimiter::default();
        assert!(limiter.check("192.168.1.1".parse().unwrap()).await);
        assert!(limiter.check("192.168.1.2".parse().unwrap()).await);

        assert_eq!(limiter.purge_stale(Duration::from_secs(600)).await, 0);
        assert_eq!(limiter.purge_stale(Duration::ZERO).await, 2);
        assert!(limiter.buckets.lock().await.is_empty());
    }

    #[test]
    fn test_message_throttle_caps_burst() {
        let mut throttle = MessageThrottle::new(0.001, 3.0);
        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn test_forwarded_header_is_used_without_connect_info() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(extract_client_ip(&req), Some("203.0.113.7".parse().unwrap()));
    }
}
