//! Gzip response compression
//!
//! Compresses the captured response body when the client advertises gzip
//! support. Requests without `Accept-Encoding: gzip` pass through
//! byte-for-byte untouched.

use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::{Request, StatusCode};
use tracing::debug;

use crate::error::{text_response, GatewayBody};
use crate::handler::{ArcHandler, BoxFuture, Handler, Middleware};
use crate::recorder::ResponseRecord;

pub fn middleware() -> Middleware {
    Box::new(|next: ArcHandler| -> ArcHandler { Arc::new(GzipHandler { next }) })
}

struct GzipHandler {
    next: ArcHandler,
}

impl Handler for GzipHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let accepts_gzip = req
            .headers()
            .get(ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);

        if !accepts_gzip {
            return self.next.handle(req);
        }

        let next = self.next.clone();
        Box::pin(async move {
            let response = next.handle(req).await;
            let mut record = match ResponseRecord::capture(response).await {
                Ok(record) => record,
                Err(_) => return text_response(StatusCode::BAD_GATEWAY, "Upstream body error"),
            };

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            let compressed = match encoder.write_all(record.body()) {
                Ok(()) => encoder.finish(),
                Err(e) => Err(e),
            };

            match compressed {
                Ok(compressed) => {
                    record.headers_mut().remove(CONTENT_LENGTH);
                    record
                        .headers_mut()
                        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                    record.set_body(compressed.into());
                }
                Err(e) => {
                    // Serve uncompressed rather than failing the request
                    debug!(error = %e, "Gzip compression failed");
                }
            }

            record.into_response()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use std::io::Read;

    const BODY: &str = "some reasonably compressible body text, repeated, repeated, repeated";

    fn terminal() -> ArcHandler {
        Arc::new(|_req: Request<GatewayBody>| -> BoxFuture {
            Box::pin(async { text_response(StatusCode::OK, BODY) })
        })
    }

    #[tokio::test]
    async fn test_compresses_when_client_accepts_gzip() {
        let handler = middleware()(terminal());
        let req = Request::builder()
            .uri("/x")
            .header(ACCEPT_ENCODING, "gzip, deflate")
            .body(full_body(""))
            .unwrap();

        let response = handler.handle(req).await;
        assert_eq!(response.headers().get(CONTENT_ENCODING).unwrap(), "gzip");

        let record = ResponseRecord::capture(response).await.unwrap();
        let mut decoder = flate2::read::GzDecoder::new(record.body().as_ref());
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, BODY);
    }

    #[tokio::test]
    async fn test_passthrough_without_accept_encoding() {
        let handler = middleware()(terminal());
        let req = Request::builder().uri("/x").body(full_body("")).unwrap();

        let response = handler.handle(req).await;
        assert!(response.headers().get(CONTENT_ENCODING).is_none());

        let record = ResponseRecord::capture(response).await.unwrap();
        assert_eq!(record.body().as_ref(), BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_stale_content_length_dropped() {
        let terminal: ArcHandler = Arc::new(|_req: Request<GatewayBody>| -> BoxFuture {
            Box::pin(async {
                let mut response = text_response(StatusCode::OK, BODY);
                response.headers_mut().insert(
                    CONTENT_LENGTH,
                    HeaderValue::from_str(&BODY.len().to_string()).unwrap(),
                );
                response
            })
        });

        let handler = middleware()(terminal);
        let req = Request::builder()
            .uri("/x")
            .header(ACCEPT_ENCODING, "gzip")
            .body(full_body(""))
            .unwrap();

        let response = handler.handle(req).await;
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
    }
}
