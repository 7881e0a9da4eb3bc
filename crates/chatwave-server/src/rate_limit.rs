use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::api::USER_HEADER;

/// Who a bucket belongs to: the client address, or the named user when the
/// address is unknown. The user header is caller-supplied, so it never
/// overrides a known address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    User(String),
    Ip(IpAddr),
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<ClientKey, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, key: ClientKey) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10.0, 30.0)
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(key) = client_key(&req) {
        if !limiter.check(key.clone()).await {
            warn!(client = ?key, "Rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

fn client_key<B>(req: &Request<B>) -> Option<ClientKey> {
    if let Some(ip) = extract_client_ip(req) {
        return Some(ClientKey::Ip(ip));
    }
    req.headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|user| ClientKey::User(user.to_string()))
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

    fn user(id: &str) -> ClientKey {
        ClientKey::User(id.to_string())
    }

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(10.0, 5.0);

        for _ in 0..5 {
            assert!(limiter.check(user("alice")).await);
        }

        assert!(!limiter.check(user("alice")).await);
    }

    #[tokio::test]
    async fn test_rate_limiter_separates_clients() {
        let limiter = RateLimiter::new(10.0, 2.0);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.check(ClientKey::Ip(ip)).await);
        assert!(limiter.check(ClientKey::Ip(ip)).await);
        assert!(!limiter.check(ClientKey::Ip(ip)).await);

        assert!(limiter.check(user("bob")).await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(10.0, 5.0);
        assert!(limiter.check(user("carol")).await);

        limiter.purge_stale(0.0).await;

        let buckets = limiter.buckets.lock().await;
        assert!(buckets.is_empty());
    }

    #[test]
    fn test_address_wins_over_user_header() {
        let addr: std::net::SocketAddr = "198.51.100.7:40000".parse().unwrap();
        let mut req = Request::builder()
            .header(USER_HEADER, "dave")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        assert_eq!(client_key(&req), Some(ClientKey::Ip(addr.ip())));

        let req = Request::builder()
            .header(USER_HEADER, "dave")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(
            client_key(&req),
            Some(ClientKey::Ip("203.0.113.9".parse().unwrap()))
        );

        let req = Request::builder()
            .header(USER_HEADER, "dave")
            .body(())
            .unwrap();
        assert_eq!(client_key(&req), Some(user("dave")));
    }

    #[tokio::test]
    async fn test_rotating_user_header_shares_one_bucket() {
        let limiter = RateLimiter::new(0.001, 3.0);
        let addr: std::net::SocketAddr = "198.51.100.7:40000".parse().unwrap();

        let mut allowed = 0;
        for i in 0..6 {
            let mut req = Request::builder()
                .header(USER_HEADER, format!("user-{i}"))
                .body(())
                .unwrap();
            req.extensions_mut().insert(ConnectInfo(addr));
            let key = client_key(&req).unwrap();
            if limiter.check(key).await {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }
}
