//! Distributed fixed-window rate limiting for the infer endpoint.
//!
//! Multiple service instances share one bucket per caller identity through
//! the counter store: the bucket key is
//! `prefix:window_index:sha256(identity)` and the count is maintained by an
//! atomic increment-and-expire. Fixed windows admit up to `2N` requests
//! across a window boundary; that edge is accepted.
//!
//! ## Response headers
//!
//! `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
//! are emitted when enabled; a limited request additionally carries
//! `Retry-After` (seconds, minimum 1).
//!
//! ## Failure policy
//!
//! Identity derivation is fail-open: a request with no derivable key is
//! allowed. Counter-store errors honour the configured fail-open /
//! fail-closed policy under a 150 ms budget.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use arbit_core::error::{Error, Result};

use crate::error::ApiError;

/// Default bucket key prefix.
pub const DEFAULT_PREFIX: &str = "arbit:rl";

/// Header consulted first when deriving the caller identity.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-voter-id";

// Budget for one counter-store round trip.
const STORE_TIMEOUT: Duration = Duration::from_millis(150);

/// Post-increment window state returned by the counter store.
#[derive(Debug, Clone, Copy)]
pub struct WindowCount {
    /// Requests counted in this window so far, including this one.
    pub count: i64,
    /// Remaining window lifetime in milliseconds.
    pub ttl_ms: i64,
}

/// Shared keyed counter store with atomic increment-and-expire.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key`, arming a TTL of `window` on first increment, and
    /// returns the post-increment count plus remaining TTL.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount>;
}

// ============================================================================
// Redis counter store
// ============================================================================

// INCR + initial PEXPIRE must be atomic, so they run as one script.
// Returns [count, ttl_ms].
const FIXED_WINDOW_SCRIPT: &str = r#"
local current = redis.call("INCR", KEYS[1])
if current == 1 then
  redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
local ttl = redis.call("PTTL", KEYS[1])
return {current, ttl}
"#;

/// Redis-backed counter store shared by all service instances.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: redis::aio::ConnectionManager,
    script: Arc<redis::Script>,
}

impl RedisCounterStore {
    /// Connects to Redis with tight timeouts and verifies the connection
    /// with a ping.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is invalid or Redis is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::InvalidInput(format!("REDIS_URL is invalid: {e}")))?;

        let config = redis::aio::ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(500))
            .set_response_timeout(Duration::from_millis(500));

        let mut conn = client
            .get_connection_manager_with_config(config)
            .await
            .map_err(|e| Error::internal(format!("redis connect: {e}")))?;

        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::internal(format!("redis ping: {e}")))?;

        Ok(Self {
            conn,
            script: Arc::new(redis::Script::new(FIXED_WINDOW_SCRIPT)),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.conn.clone();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::internal(format!("redis incr: {e}")))?;
        Ok(WindowCount { count, ttl_ms })
    }
}

// ============================================================================
// In-memory counter store
// ============================================================================

/// In-memory counter store intended for tests and dev.
///
/// Mirrors the increment-and-expire semantics of the Redis script within
/// one process.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    buckets: Mutex<HashMap<String, (i64, Instant)>>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut buckets = self.buckets.lock().expect("lock poisoned");
        let now = Instant::now();
        buckets.retain(|_, entry| entry.1 > now);

        let entry = buckets
            .entry(key.to_string())
            .or_insert((0, now + window));
        entry.0 += 1;
        let ttl_ms = i64::try_from(entry.1.saturating_duration_since(now).as_millis())
            .unwrap_or(i64::MAX);
        Ok(WindowCount {
            count: entry.0,
            ttl_ms,
        })
    }
}

// ============================================================================
// Identity derivation
// ============================================================================

/// Derives the caller identity for rate limiting.
///
/// Prefers the configured header, then the first valid `X-Forwarded-For`
/// entry, then `X-Real-IP`, then the socket peer address. Returns `None`
/// when nothing can be derived; such requests are allowed.
#[must_use]
pub fn derive_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    identity_header: &str,
) -> Option<String> {
    if let Some(value) = header_str(headers, identity_header) {
        return Some(format!("{identity_header}:{value}"));
    }
    client_ip(headers, peer).map(|ip| format!("ip:{ip}"))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        if let Ok(ip) = real_ip.parse::<IpAddr>() {
            return Some(ip);
        }
    }
    peer.map(|addr| addr.ip())
}

/// Builds the bucket key for an identity in the current window.
///
/// Hashing the identity bounds key length and strips untrusted characters.
#[must_use]
pub fn bucket_key(prefix: &str, identity: &str, window: Duration, now_unix_secs: u64) -> String {
    let window_secs = window.as_secs().max(1);
    let bucket = now_unix_secs / window_secs;
    let digest = Sha256::digest(identity.as_bytes());
    format!("{prefix}:{bucket}:{}", hex::encode(digest))
}

// ============================================================================
// Middleware
// ============================================================================

/// Rate limiter state shared across requests.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    prefix: String,
    limit: i64,
    window: Duration,
    identity_header: String,
    fail_open: bool,
    add_headers: bool,
}

impl RateLimiter {
    /// Creates a limiter with default prefix, identity header, fail-open
    /// policy and header emission.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, limit: i64, window: Duration) -> Self {
        Self {
            store,
            prefix: DEFAULT_PREFIX.to_string(),
            limit: limit.max(1),
            window,
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
            fail_open: true,
            add_headers: true,
        }
    }

    /// Overrides the bucket key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Switches to fail-closed: counter-store failures reject requests.
    #[must_use]
    pub fn fail_closed(mut self) -> Self {
        self.fail_open = false;
        self
    }

    fn rate_headers(&self, count: i64, ttl_ms: i64) -> Vec<(header::HeaderName, HeaderValue)> {
        if !self.add_headers {
            return Vec::new();
        }
        let mut headers = vec![
            (
                header::HeaderName::from_static("x-ratelimit-limit"),
                int_header(self.limit),
            ),
            (
                header::HeaderName::from_static("x-ratelimit-remaining"),
                int_header((self.limit - count).max(0)),
            ),
        ];
        if ttl_ms > 0 {
            headers.push((
                header::HeaderName::from_static("x-ratelimit-reset"),
                int_header(ceil_secs(ttl_ms)),
            ));
        }
        headers
    }
}

fn int_header(value: i64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or(HeaderValue::from_static("0"))
}

fn ceil_secs(ttl_ms: i64) -> i64 {
    (ttl_ms + 999) / 1000
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Axum middleware enforcing the fixed-window limit.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let Some(identity) = derive_identity(req.headers(), peer, &limiter.identity_header) else {
        // No derivable identity: allow rather than share one global bucket.
        return next.run(req).await;
    };

    let key = bucket_key(&limiter.prefix, &identity, limiter.window, now_unix_secs());
    let counted = tokio::time::timeout(
        STORE_TIMEOUT,
        limiter.store.incr_window(&key, limiter.window),
    )
    .await;

    let window = match counted {
        Ok(Ok(window)) => window,
        Ok(Err(error)) => {
            tracing::warn!(error = %error, "counter store error");
            return unavailable_or_pass(&limiter, req, next).await;
        }
        Err(_) => {
            tracing::warn!("counter store timed out");
            return unavailable_or_pass(&limiter, req, next).await;
        }
    };

    let extra_headers = limiter.rate_headers(window.count, window.ttl_ms);

    if window.count > limiter.limit {
        crate::metrics::record_rate_limit_hit(req.uri().path());
        let retry_after = ceil_secs(window.ttl_ms.max(0)).max(1);
        let mut response = ApiError::too_many_requests("RATE_LIMITED", "rate limit exceeded")
            .with_retry_after(u64::try_from(retry_after).unwrap_or(1))
            .into_response();
        response.headers_mut().extend(extra_headers);
        return response;
    }

    let mut response = next.run(req).await;
    response.headers_mut().extend(extra_headers);
    response
}

async fn unavailable_or_pass(
    limiter: &RateLimiter,
    req: Request<Body>,
    next: Next,
) -> Response {
    if limiter.fail_open {
        next.run(req).await
    } else {
        ApiError::service_unavailable("rate limiter unavailable").into_response()
    }
}
