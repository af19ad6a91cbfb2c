//! Routing-anomaly scoring middleware
//!
//! Resolves the session via the tracking cookie (minting one for new
//! clients), strips the cookie from the upstream-bound request, records
//! the navigation transition, and attaches the resulting anomaly score to
//! the request as a header before calling the inner chain.

use std::sync::Arc;

use hyper::header::{HeaderValue, REFERER};
use hyper::{Request, Uri};

use crate::anomaly::AnomalyDetector;
use crate::error::GatewayBody;
use crate::handler::{ArcHandler, BoxFuture, Handler, Middleware};

pub fn middleware(detector: Arc<AnomalyDetector>) -> Middleware {
    Box::new(move |next: ArcHandler| -> ArcHandler {
        Arc::new(AnomalyHandler { next, detector })
    })
}

struct AnomalyHandler {
    next: ArcHandler,
    detector: Arc<AnomalyDetector>,
}

impl Handler for AnomalyHandler {
    fn handle(&self, mut req: Request<GatewayBody>) -> BoxFuture {
        let tracker = self.detector.tracker();

        // Resolve the session id; the cookie must not reach the origin
        let (session_id, is_new_session) = match tracker.get(req.headers()) {
            Some(id) => {
                tracker.remove(req.headers_mut());
                (id, false)
            }
            None => (tracker.mint(), true),
        };

        let referer_path = req
            .headers()
            .get(REFERER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Uri>().ok())
            .map(|uri| uri.path().to_string());

        let current_path = req.uri().path().to_string();
        let score = self
            .detector
            .observe(&session_id, referer_path.as_deref(), &current_path);

        if let Ok(value) = HeaderValue::from_str(&format!("{score:.2}")) {
            req.headers_mut()
                .insert(self.detector.header().clone(), value);
        }

        let next = self.next.clone();
        let detector = Arc::clone(&self.detector);
        Box::pin(async move {
            let mut response = next.handle(req).await;
            if is_new_session {
                detector
                    .tracker()
                    .set(response.headers_mut(), &session_id);
            }
            response
        })
    }
}
