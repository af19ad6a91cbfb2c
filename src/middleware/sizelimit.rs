//! Request body size cap
//!
//! Buffers the request body up to one byte past the configured maximum.
//! Overflow yields `413 Payload Too Large`; otherwise the buffered body is
//! restored so the inner chain reads it as usual.

use std::sync::Arc;

use http_body_util::{BodyExt, Limited};
use hyper::{Request, StatusCode};

use crate::error::{full_body, text_response, GatewayBody};
use crate::handler::{ArcHandler, BoxFuture, Handler, Middleware};

pub fn middleware(max_size: u64) -> Middleware {
    Box::new(move |next: ArcHandler| -> ArcHandler {
        Arc::new(SizeLimitHandler { next, max_size })
    })
}

struct SizeLimitHandler {
    next: ArcHandler,
    max_size: u64,
}

impl Handler for SizeLimitHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let next = self.next.clone();
        let max_size = self.max_size;

        Box::pin(async move {
            let (parts, body) = req.into_parts();

            // One extra byte distinguishes "exactly max" from overflow
            let limited = Limited::new(body, max_size as usize + 1);
            let collected = match limited.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return text_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        format!(
                            "Request body too large. Maximum allowed size is {max_size} bytes."
                        ),
                    )
                }
            };

            if collected.len() as u64 > max_size {
                return text_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("Request body too large. Maximum allowed size is {max_size} bytes."),
                );
            }

            let req = Request::from_parts(parts, full_body(collected));
            next.handle(req).await
        })
    }
}
