//! Size & rate guard for inbound ADF submissions.
//!
//! The rate table is a sliding-window log per client IP, held in a `moka`
//! cache so idle addresses expire on their own. Each entry is guarded by its
//! own mutex, so concurrent requests from one IP never lose an update.

use axum::{
    body::Bytes,
    extract::rejection::BytesRejection,
    http::{HeaderMap, StatusCode},
};
use moka::future::Cache;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::errors::AppError;

type RequestLog = Arc<Mutex<VecDeque<Instant>>>;

/// Result of recording one request against an IP's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests seen in the trailing window, including this one.
    pub count: usize,
    pub retry_after: Duration,
}

/// Sliding-window request counter keyed by client IP.
#[derive(Clone)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    logs: Cache<IpAddr, RequestLog>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        let logs = Cache::builder()
            .time_to_idle(window)
            .max_capacity(100_000)
            .build();

        Self {
            limit,
            window,
            logs,
        }
    }

    /// Records a request from `ip` now.
    pub async fn hit(&self, ip: IpAddr) -> RateDecision {
        self.hit_at(ip, Instant::now()).await
    }

    /// Records a request from `ip` at `now`.
    ///
    /// Every request is recorded, whether or not it is later accepted.
    pub async fn hit_at(&self, ip: IpAddr, now: Instant) -> RateDecision {
        let log = self
            .logs
            .get_with(ip, async { Arc::new(Mutex::new(VecDeque::new())) })
            .await;
        let mut log = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        log.push_back(now);
        // Only the newest limit + 1 entries can change a decision.
        while log.len() > self.limit + 1 {
            log.pop_front();
        }

        let count = log.len();
        if count <= self.limit {
            return RateDecision {
                allowed: true,
                count,
                retry_after: Duration::ZERO,
            };
        }

        // The next request is admitted once this entry leaves the window.
        let blocking = log[count - self.limit];
        let retry_after = self
            .window
            .saturating_sub(now.saturating_duration_since(blocking));

        RateDecision {
            allowed: false,
            count,
            retry_after,
        }
    }
}

/// Admission control in front of the ADF parser.
#[derive(Clone)]
pub struct IngestGuard {
    max_payload_bytes: usize,
    limiter: RateLimiter,
}

impl IngestGuard {
    pub fn new(max_payload_bytes: usize, limiter: RateLimiter) -> Self {
        Self {
            max_payload_bytes,
            limiter,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_payload_bytes,
            RateLimiter::new(
                config.rate_limit_requests,
                Duration::from_secs(config.rate_limit_window_secs),
            ),
        )
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Records the request and returns the buffered body if it may proceed.
    ///
    /// Size is judged before rate, so an oversized body is always a 413.
    pub async fn admit(
        &self,
        ip: IpAddr,
        body: Result<Bytes, BytesRejection>,
    ) -> Result<Bytes, AppError> {
        let decision = self.limiter.hit(ip).await;

        let body = body.map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                AppError::PayloadTooLarge {
                    limit_bytes: self.max_payload_bytes,
                }
            } else {
                AppError::MalformedInput(format!(
                    "failed to read request body: {}",
                    rejection.body_text()
                ))
            }
        })?;

        if body.len() > self.max_payload_bytes {
            return Err(AppError::PayloadTooLarge {
                limit_bytes: self.max_payload_bytes,
            });
        }

        if !decision.allowed {
            tracing::warn!(
                "Rate limit exceeded for {}: {} requests in window",
                ip,
                decision.count
            );
            return Err(AppError::RateLimited {
                retry_after_secs: decision.retry_after.as_secs().max(1),
            });
        }

        Ok(body)
    }
}

/// Resolves the client address used as the rate-limit key.
///
/// Forwarding headers are only honoured when `trust_proxy_headers` is set,
/// since any client can forge them. The rightmost `X-Forwarded-For` hop is
/// the one appended by the trusted proxy; earlier entries are client-supplied.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy_headers: bool) -> IpAddr {
    if trust_proxy_headers {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            return ip;
        }
    }

    peer.map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(30, Duration::from_secs(60));
        let start = Instant::now();

        for i in 0..30 {
            let decision = limiter.hit_at(ip(1), start + Duration::from_millis(i)).await;
            assert!(decision.allowed, "request {} should pass", i + 1);
        }

        let rejected = (30..35u64)
            .map(|i| start + Duration::from_millis(i))
            .collect::<Vec<_>>();
        for at in rejected {
            assert!(!limiter.hit_at(ip(1), at).await.allowed);
        }
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.hit_at(ip(2), start).await.allowed);
        assert!(limiter.hit_at(ip(2), start + Duration::from_secs(10)).await.allowed);
        let blocked = limiter.hit_at(ip(2), start + Duration::from_secs(20)).await;
        assert!(!blocked.allowed);
        // Oldest counted entry is the one at +10s, so it clears at +70s.
        assert_eq!(blocked.retry_after, Duration::from_secs(50));

        let later = limiter.hit_at(ip(2), start + Duration::from_secs(71)).await;
        assert!(later.allowed);
    }

    #[tokio::test]
    async fn test_ips_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.hit_at(ip(3), now).await.allowed);
        assert!(!limiter.hit_at(ip(3), now).await.allowed);
        assert!(limiter.hit_at(ip(4), now).await.allowed);
    }

    #[tokio::test]
    async fn test_concurrent_hits_are_not_lost() {
        let limiter = RateLimiter::new(50, Duration::from_secs(60));
        let mut handles = vec![];
        for _ in 0..80 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.hit(ip(5)).await }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 50);
    }

    #[tokio::test]
    async fn test_admit_rejects_oversized_body_even_when_rate_limited() {
        let guard = IngestGuard::new(8, RateLimiter::new(1, Duration::from_secs(60)));
        assert!(guard.admit(ip(6), Ok(Bytes::from_static(b"<a/>"))).await.is_ok());

        let err = guard
            .admit(ip(6), Ok(Bytes::from_static(b"<adf>0123456789</adf>")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge { limit_bytes: 8 }));

        let err = guard
            .admit(ip(6), Ok(Bytes::from_static(b"<a/>")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited { .. }));
    }

    #[test]
    fn test_client_ip_ignores_forwarded_headers_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let peer: SocketAddr = "192.0.2.1:5555".parse().unwrap();

        assert_eq!(
            client_ip(&headers, Some(peer), false),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip(&headers, Some(peer), true),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip(&HeaderMap::new(), None, true),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn test_client_ip_ignores_spoofed_leading_forwarded_entries() {
        let peer: SocketAddr = "192.0.2.1:5555".parse().unwrap();
        let proxy_seen = "198.51.100.77".parse::<IpAddr>().unwrap();

        for spoofed in ["1.1.1.1", "2.2.2.2, 3.3.3.3", "garbage"] {
            let mut headers = HeaderMap::new();
            let value = format!("{}, 198.51.100.77", spoofed);
            headers.insert("x-forwarded-for", HeaderValue::from_str(&value).unwrap());
            assert_eq!(client_ip(&headers, Some(peer), true), proxy_seen);
        }
    }
}
