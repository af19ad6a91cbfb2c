//! Access logging middleware
//!
//! Emits one structured line per request after the response is produced,
//! in the spirit of an nginx access log.

use std::sync::Arc;
use std::time::Instant;

use hyper::body::Body;
use hyper::Request;
use tracing::info;

use crate::error::GatewayBody;
use crate::handler::{ArcHandler, BoxFuture, ClientAddr, Handler, Middleware, TlsSession};

pub fn middleware() -> Middleware {
    Box::new(|next: ArcHandler| -> ArcHandler { Arc::new(LoggingHandler { next }) })
}

struct LoggingHandler {
    next: ArcHandler,
}

impl Handler for LoggingHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let start = Instant::now();

        let remote = req
            .extensions()
            .get::<ClientAddr>()
            .map(|a| a.0.to_string())
            .unwrap_or_else(|| "-".to_string());
        let scheme = match req.extensions().get::<TlsSession>() {
            Some(TlsSession(true)) => "https",
            _ => "http",
        };
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let user_agent = req
            .headers()
            .get(hyper::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();

        let next = self.next.clone();
        Box::pin(async move {
            let response = next.handle(req).await;

            let status = response.status().as_u16();
            let size = response.body().size_hint().exact().unwrap_or(0);
            let duration_ms = start.elapsed().as_millis() as u64;

            info!(
                target: "access",
                remote = %remote,
                method = %method,
                path = %path,
                status,
                size,
                duration_ms,
                url = %format!("{scheme}://{host}{path}"),
                user_agent = %user_agent,
                "request"
            );

            response
        })
    }
}
