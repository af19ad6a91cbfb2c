//! Header add / omit middlewares
//!
//! `add_headers` sets configured headers on the upstream-bound request.
//! `omit_headers` strips configured headers from the response, typically
//! to hide server identification.

use std::collections::HashMap;
use std::sync::Arc;

use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, StatusCode};

use crate::error::{text_response, GatewayBody};
use crate::handler::{ArcHandler, BoxFuture, Handler, Middleware};
use crate::recorder::ResponseRecord;

pub fn add_headers(headers: HashMap<String, String>) -> Middleware {
    // Parse once at construction; invalid names or values are dropped
    let parsed: Vec<(HeaderName, HeaderValue)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.parse::<HeaderName>().ok()?;
            let value = HeaderValue::from_str(value).ok()?;
            Some((name, value))
        })
        .collect();

    Box::new(move |next: ArcHandler| -> ArcHandler {
        Arc::new(AddHeadersHandler {
            next,
            headers: parsed,
        })
    })
}

struct AddHeadersHandler {
    next: ArcHandler,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Handler for AddHeadersHandler {
    fn handle(&self, mut req: Request<GatewayBody>) -> BoxFuture {
        for (name, value) in &self.headers {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        self.next.handle(req)
    }
}

pub fn omit_headers(names: Vec<String>) -> Middleware {
    let parsed: Vec<HeaderName> = names
        .iter()
        .filter_map(|name| name.parse::<HeaderName>().ok())
        .collect();

    Box::new(move |next: ArcHandler| -> ArcHandler {
        Arc::new(OmitHeadersHandler {
            next,
            names: parsed,
        })
    })
}

struct OmitHeadersHandler {
    next: ArcHandler,
    names: Vec<HeaderName>,
}

impl Handler for OmitHeadersHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let next = self.next.clone();
        let names = self.names.clone();

        Box::pin(async move {
            let response = next.handle(req).await;
            let mut record = match ResponseRecord::capture(response).await {
                Ok(record) => record,
                Err(_) => return text_response(StatusCode::BAD_GATEWAY, "Upstream body error"),
            };

            for name in &names {
                record.headers_mut().remove(name);
            }

            record.into_response()
        })
    }
}
