//! Per-key token-bucket rate limiting
//!
//! Rules are configured as `<zone>-<N>/<unit>` strings, e.g. `ip-10/m`:
//! at most 10 requests per minute per client IP. Buckets are created
//! lazily under a composite key that includes the window and burst, so
//! distinct limit configurations never collide on the same identity.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use hyper::header::HeaderValue;
use hyper::{Request, StatusCode};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{text_response, ConfigError, GatewayBody};
use crate::handler::{ArcHandler, BoxFuture, ClientAddr, Handler, Middleware};

/// Limiter zones; only client-IP keying is supported.
pub const SUPPORTED_ZONES: [&str; 1] = ["ip"];

/// One parsed rate-limit rule.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitRule {
    pub zone: String,
    pub requests: u32,
    pub per: Duration,
}

impl LimitRule {
    /// Composite bucket key for this rule and request identity.
    fn key(&self, req: &Request<GatewayBody>) -> Option<String> {
        let identity = match self.zone.as_str() {
            "ip" => {
                let addr = req.extensions().get::<ClientAddr>()?;
                addr.0.ip().to_string()
            }
            _ => return None,
        };
        Some(format!(
            "{}|{}!{}:{}",
            self.per.as_secs(),
            self.requests,
            self.zone,
            identity
        ))
    }
}

/// Parse a rule string of the form `<zone>-<N>/<unit>`.
pub fn parse_limit_rule(rule: &str) -> Result<LimitRule, ConfigError> {
    let (zone, limit) = rule
        .split_once('-')
        .ok_or_else(|| ConfigError::invalid(format!("invalid rate limit rule '{rule}'")))?;

    if !SUPPORTED_ZONES.contains(&zone.to_lowercase().as_str()) {
        return Err(ConfigError::invalid(format!(
            "rate limit zone '{zone}' is not supported"
        )));
    }

    let (count, unit) = limit
        .split_once('/')
        .ok_or_else(|| ConfigError::invalid(format!("invalid rate limit rule '{rule}'")))?;

    let requests: u32 = count
        .parse()
        .map_err(|_| ConfigError::invalid(format!("invalid request count '{count}'")))?;
    if requests == 0 {
        return Err(ConfigError::invalid("rate limit count must be above 0"));
    }

    let per = match unit {
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(60 * 60),
        "d" => Duration::from_secs(60 * 60 * 24),
        other => {
            return Err(ConfigError::invalid(format!(
                "invalid rate limit unit '{other}'"
            )))
        }
    };

    Ok(LimitRule {
        zone: zone.to_lowercase(),
        requests,
        per,
    })
}

/// Classic token bucket: capacity `burst`, refilled continuously.
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

    /// Refill for elapsed time and try to take one token. Returns whether
    /// the request is allowed and the tokens left afterwards.
    fn allow(&mut self, capacity: f64, refill_per_sec: f64) -> (bool, f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            (true, self.tokens)
        } else {
            (false, self.tokens)
        }
    }
}

/// Lazily populated bucket table shared by all requests on a route.
pub struct RateLimiter {
    buckets: DashMap<String, Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Check one rule for one bucket key.
    fn allow(&self, key: &str, rule: &LimitRule) -> (bool, f64) {
        let capacity = f64::from(rule.requests);
        let refill_per_sec = capacity / rule.per.as_secs_f64();

        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(capacity)));
        let mut bucket = bucket.lock();
        bucket.allow(capacity, refill_per_sec)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the rate-limit middleware for a route. Rules are checked in
/// order; the first denial responds 429 with the `X-RateLimit-*` headers.
pub fn middleware(rules: Vec<LimitRule>) -> Middleware {
    let limiter = Arc::new(RateLimiter::new());

    Box::new(move |next: ArcHandler| -> ArcHandler {
        Arc::new(RateLimitHandler {
            limiter: Arc::clone(&limiter),
            rules: rules.clone(),
            next,
        })
    })
}

struct RateLimitHandler {
    limiter: Arc<RateLimiter>,
    rules: Vec<LimitRule>,
    next: ArcHandler,
}

impl Handler for RateLimitHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        for rule in &self.rules {
            let key = match rule.key(&req) {
                Some(key) => key,
                // No identity available for the zone: skip the rule
                None => continue,
            };

            let (allowed, tokens) = self.limiter.allow(&key, rule);
            if !allowed {
                debug!(key = %key, "Rate limit exceeded");
                let mut response =
                    text_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");

                let reset = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
                    + rule.per.as_secs();
                let headers = response.headers_mut();
                headers.insert(
                    "X-RateLimit-Limit",
                    HeaderValue::from_str(&rule.requests.to_string())
                        .expect("numeric header value"),
                );
                headers.insert(
                    "X-RateLimit-Remaining",
                    HeaderValue::from_str(&(tokens as u64).to_string())
                        .expect("numeric header value"),
                );
                headers.insert(
                    "X-RateLimit-Reset",
                    HeaderValue::from_str(&reset.to_string()).expect("numeric header value"),
                );

                return Box::pin(async move { response });
            }
        }

        self.next.handle(req)
    }
}
