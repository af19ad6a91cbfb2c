//! URL-keyed response cache with per-entry expiry
//!
//! Entries are inserted by the cache middleware when an upstream response
//! carries caching directives, and dropped either lazily on an expired hit
//! or by the periodic janitor sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use hyper::{HeaderMap, StatusCode};
use tokio::sync::watch;
use tracing::debug;

/// How often the janitor evicts expired entries.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(600);

/// A buffered response held until its expiry.
#[derive(Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    expires_at: Instant,
}

/// Concurrent map from request URL to cached response.
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Fetch a live entry. Expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Store a response under `key` for `ttl`.
    pub fn set(&self, key: &str, status: StatusCode, headers: HeaderMap, body: Bytes, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CachedResponse {
                status,
                headers,
                body,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Cache janitor sweep");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run periodic sweeps until the shutdown signal flips.
    pub fn start_janitor(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick carries no work
            loop {
                tokio::select! {
                    _ = ticker.tick() => cache.sweep(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}
