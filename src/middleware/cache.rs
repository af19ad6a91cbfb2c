//! Response caching middleware
//!
//! Read-through cache keyed by the request URL. A miss runs the inner
//! chain and caches the captured response when its headers direct a
//! positive TTL: `Cache-Control: max-age=N` wins, then `Expires`
//! (RFC 1123). A hit replays status, headers and body without invoking
//! the chain at all.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hyper::header::{CACHE_CONTROL, EXPIRES};
use hyper::{Request, Response, StatusCode};
use tracing::debug;

use crate::cache::ResponseCache;
use crate::error::{full_body, text_response, GatewayBody};
use crate::handler::{ArcHandler, BoxFuture, Handler, Middleware};
use crate::recorder::ResponseRecord;

pub fn middleware(cache: Arc<ResponseCache>) -> Middleware {
    Box::new(move |next: ArcHandler| -> ArcHandler {
        Arc::new(CacheHandler { next, cache })
    })
}

struct CacheHandler {
    next: ArcHandler,
    cache: Arc<ResponseCache>,
}

impl Handler for CacheHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let key = req.uri().to_string();

        if let Some(entry) = self.cache.get(&key) {
            debug!(key = %key, "Serving cached response");
            let mut response = Response::new(full_body(entry.body));
            *response.status_mut() = entry.status;
            *response.headers_mut() = entry.headers;
            return Box::pin(async move { response });
        }

        let next = self.next.clone();
        let cache = Arc::clone(&self.cache);
        Box::pin(async move {
            let response = next.handle(req).await;
            let record = match ResponseRecord::capture(response).await {
                Ok(record) => record,
                Err(_) => return text_response(StatusCode::BAD_GATEWAY, "Upstream body error"),
            };

            if let Some(ttl) = cache_ttl(&record) {
                cache.set(
                    &key,
                    record.status(),
                    record.headers().clone(),
                    record.body().clone(),
                    ttl,
                );
            }

            record.into_response()
        })
    }
}

/// TTL directed by the response headers, or `None` when uncacheable.
fn cache_ttl(record: &ResponseRecord) -> Option<Duration> {
    let cache_control = record
        .headers()
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(max_age) = parse_max_age(cache_control) {
        if max_age > 0 {
            return Some(Duration::from_secs(max_age as u64));
        }
    }

    let expires = record
        .headers()
        .get(EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_expires)?;
    let remaining = expires.signed_duration_since(Utc::now());
    if remaining > chrono::Duration::zero() {
        return remaining.to_std().ok();
    }

    None
}

/// First parseable `max-age` directive wins; non-integer values are
/// ignored.
fn parse_max_age(cache_control: &str) -> Option<i64> {
    for directive in cache_control.split(',') {
        let directive = directive.trim();
        if let Some(value) = directive.strip_prefix("max-age=") {
            if let Ok(seconds) = value.parse::<i64>() {
                return Some(seconds);
            }
        }
    }
    None
}

/// Parse an RFC 1123 `Expires` value, e.g. `Tue, 10 Nov 2099 23:00:00 GMT`.
fn parse_expires(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use hyper::header::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Terminal that counts invocations and serves a versioned body.
    fn counting_terminal(
        cache_header: Option<&'static str>,
        hits: Arc<AtomicUsize>,
    ) -> ArcHandler {
        Arc::new(move |_req: Request<GatewayBody>| -> BoxFuture {
            let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
            let cache_header = cache_header;
            Box::pin(async move {
                let mut response = text_response(StatusCode::OK, format!("v{n}"));
                if let Some(value) = cache_header {
                    response
                        .headers_mut()
                        .insert(CACHE_CONTROL, HeaderValue::from_static(value));
                }
                response
            })
        })
    }

    fn request(uri: &str) -> Request<GatewayBody> {
        Request::builder().uri(uri).body(full_body("")).unwrap()
    }

    async fn body_of(response: Response<GatewayBody>) -> Vec<u8> {
        ResponseRecord::capture(response)
            .await
            .unwrap()
            .body()
            .to_vec()
    }

    #[tokio::test]
    async fn test_cacheable_response_served_from_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ResponseCache::new());
        let handler =
            middleware(Arc::clone(&cache))(counting_terminal(Some("max-age=60"), hits.clone()));

        let first = handler.handle(request("/data")).await;
        assert_eq!(body_of(first).await, b"v1");

        let second = handler.handle(request("/data")).await;
        assert_eq!(body_of(second).await, b"v1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_uncacheable_response_always_invokes_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ResponseCache::new());
        let handler = middleware(Arc::clone(&cache))(counting_terminal(None, hits.clone()));

        assert_eq!(body_of(handler.handle(request("/data")).await).await, b"v1");
        assert_eq!(body_of(handler.handle(request("/data")).await).await, b"v2");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_urls_cached_separately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ResponseCache::new());
        let handler =
            middleware(Arc::clone(&cache))(counting_terminal(Some("max-age=60"), hits.clone()));

        assert_eq!(body_of(handler.handle(request("/a")).await).await, b"v1");
        assert_eq!(body_of(handler.handle(request("/b")).await).await, b"v2");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_reinvokes_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ResponseCache::new());
        let handler =
            middleware(Arc::clone(&cache))(counting_terminal(Some("max-age=1"), hits.clone()));

        assert_eq!(body_of(handler.handle(request("/x")).await).await, b"v1");
        assert_eq!(body_of(handler.handle(request("/x")).await).await, b"v1");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(body_of(handler.handle(request("/x")).await).await, b"v2");
    }

    #[tokio::test]
    async fn test_cached_headers_replayed() {
        let terminal: ArcHandler = Arc::new(|_req: Request<GatewayBody>| -> BoxFuture {
            Box::pin(async {
                let mut response = text_response(StatusCode::OK, "payload");
                response
                    .headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
                response
                    .headers_mut()
                    .insert("x-origin", HeaderValue::from_static("backend-1"));
                response
            })
        });

        let cache = Arc::new(ResponseCache::new());
        let handler = middleware(cache)(terminal);

        let _ = handler.handle(request("/h")).await;
        let hit = handler.handle(request("/h")).await;
        assert_eq!(hit.headers().get("x-origin").unwrap(), "backend-1");
    }

    #[test]
    fn test_parse_max_age() {
        assert_eq!(parse_max_age("max-age=60"), Some(60));
        assert_eq!(parse_max_age("public, max-age=30, immutable"), Some(30));
        assert_eq!(parse_max_age("max-age=abc, max-age=15"), Some(15));
        assert_eq!(parse_max_age("no-store"), None);
        assert_eq!(parse_max_age(""), None);
    }

    #[test]
    fn test_parse_expires() {
        let parsed = parse_expires("Tue, 10 Nov 2099 23:00:00 GMT").unwrap();
        assert!(parsed > Utc::now());
        assert!(parse_expires("not a date").is_none());
    }

    #[test]
    fn test_ttl_prefers_max_age_over_expires() {
        let mut record = ResponseRecord::new();
        record
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("max-age=10"));
        record.headers_mut().insert(
            EXPIRES,
            HeaderValue::from_static("Tue, 10 Nov 2099 23:00:00 GMT"),
        );

        let ttl = cache_ttl(&record).unwrap();
        assert_eq!(ttl, Duration::from_secs(10));
    }

    #[test]
    fn test_ttl_falls_back_to_expires() {
        let mut record = ResponseRecord::new();
        record.headers_mut().insert(
            EXPIRES,
            HeaderValue::from_static("Tue, 10 Nov 2099 23:00:00 GMT"),
        );

        assert!(cache_ttl(&record).unwrap() > Duration::from_secs(3600));
    }

    #[test]
    fn test_past_expires_is_uncacheable() {
        let mut record = ResponseRecord::new();
        record.headers_mut().insert(
            EXPIRES,
            HeaderValue::from_static("Tue, 10 Nov 2009 23:00:00 GMT"),
        );

        assert!(cache_ttl(&record).is_none());
    }
}
