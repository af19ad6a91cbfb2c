//! In-memory capture of a produced response
//!
//! Several middlewares (gzip, omit-headers, cache) must inspect or rewrite
//! a response after the inner handler has produced it. `ResponseRecord`
//! buffers the status, header map, and full body, and can replay itself
//! into a wire response without loss.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Response, StatusCode};

use crate::error::{full_body, GatewayBody};

/// A fully buffered response.
pub struct ResponseRecord {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ResponseRecord {
    /// An empty record. Reads as status 200 until a status is recorded.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Drain a response into a record, buffering the whole body.
    pub async fn capture(response: Response<GatewayBody>) -> Result<Self, hyper::Error> {
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await?.to_bytes();

        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body: bytes,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Rebuild the wire response. Replaying an unmodified record yields a
    /// response equivalent to the one captured.
    pub fn into_response(self) -> Response<GatewayBody> {
        let mut response = Response::new(full_body(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl Default for ResponseRecord {
    fn default() -> Self {
        Self::new()
    }
}
