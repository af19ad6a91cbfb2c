//! Request tracing middleware
//!
//! Wraps each request in a `tracing` span carrying a generated request id,
//! method and path, so downstream log lines correlate. Exporter wiring is
//! outside the gateway; the span integrates with whatever subscriber the
//! binary installs.

use std::sync::Arc;

use hyper::Request;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::GatewayBody;
use crate::handler::{ArcHandler, BoxFuture, Handler, Middleware};

/// Identifies a request across log lines and, when forwarded, upstream hops.
pub const X_REQUEST_ID: &str = "x-request-id";

pub fn middleware() -> Middleware {
    Box::new(|next: ArcHandler| -> ArcHandler { Arc::new(TraceHandler { next }) })
}

struct TraceHandler {
    next: ArcHandler,
}

impl Handler for TraceHandler {
    fn handle(&self, mut req: Request<GatewayBody>) -> BoxFuture {
        // Propagate an existing request id, mint one otherwise
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Ok(value) = hyper::header::HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(X_REQUEST_ID, value);
        }

        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
        );

        let next = self.next.clone();
        Box::pin(
            async move {
                let response = next.handle(req).await;
                tracing::debug!(status = response.status().as_u16(), "request completed");
                response
            }
            .instrument(span),
        )
    }
}
