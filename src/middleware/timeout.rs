//! Per-route request deadline
//!
//! Bounds the whole inner chain, terminal included, by a deadline. On
//! expiry the client receives `504 Gateway Timeout` and the in-flight
//! inner future is dropped, so a slow terminal cannot write after the
//! timeout response has been sent.

use std::sync::Arc;
use std::time::Duration;

use hyper::{Request, StatusCode};
use tracing::warn;

use crate::error::{text_response, GatewayBody};
use crate::handler::{ArcHandler, BoxFuture, Handler, Middleware};

pub fn middleware(timeout: Duration) -> Middleware {
    Box::new(move |next: ArcHandler| -> ArcHandler {
        Arc::new(TimeoutHandler { next, timeout })
    })
}

struct TimeoutHandler {
    next: ArcHandler,
    timeout: Duration,
}

impl Handler for TimeoutHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let path = req.uri().path().to_string();
        let timeout = self.timeout;
        let inner = self.next.handle(req);

        Box::pin(async move {
            match tokio::time::timeout(timeout, inner).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(path = %path, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                    text_response(StatusCode::GATEWAY_TIMEOUT, "Request timed out")
                }
            }
        })
    }
}
