//! Single-origin reverse proxy terminal
//!
//! Forwards requests to one configured origin over a shared pooled client,
//! rewriting the `Host` header and stamping the standard `X-Forwarded-*`
//! headers. Request and response bodies stream through unmodified.

use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::header::HeaderValue;
use hyper::http::uri::{Authority, Scheme};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};

use crate::error::{status_response, ConfigError, GatewayBody};
use crate::handler::{BoxFuture, ClientAddr, Handler, TlsSession};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Pooled upstream HTTP client shared by every proxying terminal.
pub type UpstreamClient = Client<HttpConnector, GatewayBody>;

/// Build the shared upstream client.
pub fn build_upstream_client() -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.enforce_http(true);

    Client::builder(TokioExecutor::new()).build(connector)
}

/// A parsed origin URL: scheme, authority and base path.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
}

impl UpstreamTarget {
    /// Parse an origin URL once, at construction.
    pub fn parse(destination: &str) -> Result<Self, ConfigError> {
        let uri: Uri = destination
            .parse()
            .map_err(|_| ConfigError::invalid(format!("invalid origin url '{destination}'")))?;

        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| ConfigError::invalid(format!("origin url '{destination}' has no scheme")))?;
        let authority = uri.authority().cloned().ok_or_else(|| {
            ConfigError::invalid(format!("origin url '{destination}' has no host"))
        })?;

        let base_path = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            scheme,
            authority,
            base_path,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Rebase a request path-and-query onto this origin.
    fn uri_for(&self, path_and_query: &str) -> Result<Uri, hyper::http::Error> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, path_and_query))
            .build()
    }
}

/// Rewrite a request for the target origin and forward it.
///
/// Transport failures surface as `502 Bad Gateway`.
pub async fn forward(
    client: &UpstreamClient,
    target: &UpstreamTarget,
    mut req: Request<GatewayBody>,
) -> Response<GatewayBody> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let uri = match target.uri_for(&path_and_query) {
        Ok(uri) => uri,
        Err(e) => {
            error!(error = %e, "Failed to build upstream URI");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let client_addr = req.extensions().get::<ClientAddr>().copied();
    let is_tls = req
        .extensions()
        .get::<TlsSession>()
        .map(|t| t.0)
        .unwrap_or(false);

    *req.uri_mut() = uri;

    // Standard reverse-proxy header contract: Host names the origin, the
    // original host and client travel in X-Forwarded-*.
    let headers = req.headers_mut();
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if let Ok(host) = HeaderValue::from_str(target.authority.as_str()) {
        headers.insert(hyper::header::HOST, host);
    }
    if let Some(ClientAddr(addr)) = client_addr {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    match client.request(req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            debug!(origin = %target.authority, error = %e, "Upstream request failed");
            status_response(StatusCode::BAD_GATEWAY)
        }
    }
}

/// Terminal handler proxying every request to a single origin.
pub struct ProxyHandler {
    client: UpstreamClient,
    target: Arc<UpstreamTarget>,
}

impl ProxyHandler {
    pub fn new(client: UpstreamClient, destination: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            target: Arc::new(UpstreamTarget::parse(destination)?),
        })
    }
}

impl Handler for ProxyHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let client = self.client.clone();
        let target = Arc::clone(&self.target);
        Box::pin(async move { forward(&client, &target, req).await })
    }
}
