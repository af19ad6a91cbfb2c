//! Error types and plain-text error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors raised while loading or validating the configuration file.
///
/// All of these are fatal: the process reports the error and exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// Body type used throughout the gateway for requests and responses.
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Build a boxed body from a chunk of bytes.
pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Build an empty boxed body.
pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Build a plain-text response with the given status code.
pub fn text_response(status: StatusCode, message: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message.into()))
        .expect("valid response builder")
}

/// Build an empty response with the given status code.
pub fn status_response(status: StatusCode) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .expect("valid response builder")
}
