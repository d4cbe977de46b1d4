use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::HeaderMap;

use crate::config::RateLimitCfg;

/// Fallback identity when neither a forwarded address nor a peer is known.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// One caller's bucket. Starts full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucket {
    pub tokens: u32,
    pub last_refill: Instant,
}

impl TokenBucket {
    pub fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refill by whole intervals, then spend one token if there is one.
    /// Time short of a whole interval stays on the clock for the next check.
    pub fn admit(&mut self, now: Instant, capacity: u32, interval: Duration) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let units = if interval.is_zero() {
            u128::from(capacity)
        } else {
            elapsed.as_nanos() / interval.as_nanos()
        };
        if units >= 1 {
            let add = u32::try_from(units).unwrap_or(u32::MAX);
            self.tokens = self.tokens.saturating_add(add).min(capacity);
            self.last_refill = now;
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// Identity → bucket mapping owned by whoever builds the server.
pub trait BucketStore: Send + Sync {
    /// Atomic per identity: two concurrent calls never share the last token.
    fn admit(&self, identity: &str, now: Instant) -> bool;
}

/// Process-memory store. Buckets are never evicted.
#[derive(Debug)]
pub struct InMemoryBucketStore {
    buckets: DashMap<String, TokenBucket>,
    capacity: u32,
    interval: Duration,
}

impl InMemoryBucketStore {
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            interval,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl From<&RateLimitCfg> for InMemoryBucketStore {
    fn from(cfg: &RateLimitCfg) -> Self {
        Self::new(cfg.capacity, Duration::from_millis(cfg.refill_interval_ms))
    }
}

impl BucketStore for InMemoryBucketStore {
    fn admit(&self, identity: &str, now: Instant) -> bool {
        // entry() holds the shard write lock until the guard drops
        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| TokenBucket::full(self.capacity, now));
        bucket.admit(now, self.capacity, self.interval)
    }
}

/// First `X-Forwarded-For` hop, else the peer address, else [`UNKNOWN_IDENTITY`].
/// The header is client-controlled and therefore spoofable.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}
