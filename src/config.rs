//! Gateway configuration: YAML schema and validation
//!
//! Configuration is loaded once at startup and validated strictly; any
//! problem is fatal. The validated `Config` is immutable for the life of
//! the process — there is no reload.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use hyper::Uri;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::middleware::ratelimit::parse_limit_rule;

/// Applied when an endpoint has no explicit timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Applied when an endpoint has no explicit request size cap: 10 MiB.
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 10 * 1024 * 1024;

pub const SUPPORTED_BALANCE_POLICIES: [&str; 3] = ["round-robin", "random", "least-latency"];

const HTTP_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Config format version; must not exceed the program version.
    pub version: String,

    /// Listen host.
    #[serde(default)]
    pub host: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: TlsConfig,

    #[serde(rename = "open_telemetry")]
    pub open_telemetry: Option<OtelConfig>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_port() -> u16 {
    80
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// Automatic certificate provisioning (requires port 443).
    #[serde(default)]
    pub auto: bool,

    #[serde(default, rename = "domain")]
    pub domains: Vec<String>,

    pub email: Option<String>,

    pub keyfile: Option<String>,
    pub certfile: Option<String>,
}

impl TlsConfig {
    /// TLS serving is enabled iff both files are configured.
    pub fn enabled(&self) -> bool {
        self.certfile.is_some() && self.keyfile.is_some()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OtelConfig {
    pub endpoint: String,
    pub sample_ratio: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// The domain / host requests are addressed to.
    pub domain: String,

    #[serde(rename = "endpoints", default)]
    pub endpoints: Vec<EndpointConfig>,

    pub anomaly_detection: Option<AnomalyDetectionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnomalyDetectionConfig {
    #[serde(default)]
    pub active: bool,

    #[serde(default = "default_anomaly_header")]
    pub header_name: String,

    #[serde(default = "default_min_score")]
    pub min_score: u32,

    #[serde(default = "default_max_score")]
    pub max_score: u32,

    #[serde(default = "default_threshold", rename = "threshold_for_rating")]
    pub threshold_for_rating: u64,
}

fn default_anomaly_header() -> String {
    "X-Anomaly-Score".to_string()
}

fn default_min_score() -> u32 {
    100
}

fn default_max_score() -> u32 {
    200
}

fn default_threshold() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Route path prefix; must begin with '/'.
    pub path: String,

    /// Origin URL for the single-host proxy terminal.
    pub destination: Option<String>,

    /// Filesystem directory for the static files terminal.
    pub directory: Option<String>,

    /// Weighted origin set for the load-balancer terminal.
    pub backend: Option<BackendConfig>,

    /// Headers added to the upstream-bound request.
    pub headers: Option<HashMap<String, String>>,

    /// Headers stripped from the response.
    #[serde(default)]
    pub omit_headers: Vec<String>,

    /// Content classes handed to the minification delegate.
    #[serde(default)]
    pub minify: Vec<String>,

    pub gzip: Option<bool>,

    /// Request deadline in seconds.
    pub timeout: Option<u64>,

    /// Request body cap in bytes.
    pub max_size: Option<u64>,

    /// OpenAPI document for the validation delegate.
    pub openapi: Option<String>,

    /// Rate limit rules, e.g. "ip-10/m".
    #[serde(default)]
    pub ratelimits: Vec<String>,

    /// Automated health checks.
    #[serde(default)]
    pub checks: Vec<CheckConfig>,

    /// Cache responses that carry cache headers.
    #[serde(default)]
    pub cache: bool,
}

impl EndpointConfig {
    pub fn timeout_secs(&self) -> u64 {
        match self.timeout {
            Some(0) | None => DEFAULT_TIMEOUT_SECS,
            Some(secs) => secs,
        }
    }

    pub fn max_request_size(&self) -> u64 {
        match self.max_size {
            Some(0) | None => DEFAULT_MAX_REQUEST_SIZE,
            Some(bytes) => bytes,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub balance_policy: String,

    #[serde(default)]
    pub servers: Vec<BackendServer>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendServer {
    pub url: String,

    #[serde(default)]
    pub weight: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckConfig {
    pub name: String,

    pub cron: String,

    pub url: String,

    #[serde(default = "default_check_method")]
    pub method: String,

    /// Probe timeout in seconds.
    #[serde(default = "default_check_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Command template spawned when the check fails. May reference
    /// `$date`, `$error` and `$check_name`.
    #[serde(default)]
    pub on_failure: String,
}

fn default_check_method() -> String {
    "GET".to_string()
}

fn default_check_timeout() -> u64 {
    10
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate(env!("CARGO_PKG_VERSION"))?;
        Ok(config)
    }

    pub fn validate(&self, program_version: &str) -> Result<(), ConfigError> {
        if self.version.is_empty() {
            return Err(ConfigError::invalid("version is required"));
        }

        let config_version = parse_version(&self.version)
            .ok_or_else(|| ConfigError::invalid("version is invalid"))?;
        let current = parse_version(program_version)
            .ok_or_else(|| ConfigError::invalid("program version is invalid"))?;
        if config_version > current {
            return Err(ConfigError::invalid(
                "config version is not supported (too advanced)",
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::invalid("host is required"));
        }

        if self.port == 0 {
            return Err(ConfigError::invalid("port is required"));
        }

        if let Some(otel) = &self.open_telemetry {
            otel.validate()?;
        }

        self.ssl.validate()?;
        if self.ssl.auto && self.port != 443 {
            return Err(ConfigError::invalid(
                "automatic TLS is only available when the server runs on port 443",
            ));
        }

        for service in &self.services {
            service.validate()?;
        }

        Ok(())
    }
}

impl OtelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::invalid("open_telemetry endpoint is required"));
        }
        if self.sample_ratio <= 0.0 {
            return Err(ConfigError::invalid(
                "open_telemetry sample ratio must be above 0",
            ));
        }
        if self.sample_ratio > 1.0 {
            return Err(ConfigError::invalid(
                "open_telemetry sample ratio cannot be above 1",
            ));
        }
        Ok(())
    }
}

impl TlsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.auto {
            if self.domains.is_empty() {
                return Err(ConfigError::invalid(
                    "automatic TLS requires a list of domains to issue certificates for",
                ));
            }
            match &self.email {
                Some(email) if is_valid_email(email) => {}
                _ => {
                    return Err(ConfigError::invalid(
                        "automatic TLS requires a valid registration email",
                    ))
                }
            }
        }

        match (&self.certfile, &self.keyfile) {
            (Some(cert), Some(key)) => {
                if !is_readable_file(cert) {
                    return Err(ConfigError::invalid(format!(
                        "can't find certfile at '{cert}'"
                    )));
                }
                if !is_readable_file(key) {
                    return Err(ConfigError::invalid(format!("can't find keyfile at '{key}'")));
                }
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::invalid(
                    "certfile and keyfile must be provided together",
                ))
            }
        }

        Ok(())
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_hostname(&self.domain) {
            return Err(ConfigError::invalid(format!(
                "invalid domain '{}'",
                self.domain
            )));
        }

        if let Some(anomaly) = &self.anomaly_detection {
            if anomaly.max_score <= anomaly.min_score {
                return Err(ConfigError::invalid(
                    "anomaly detection max_score must be greater than min_score",
                ));
            }
        }

        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }

        Ok(())
    }
}

impl EndpointConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::invalid("endpoint path must start with '/'"));
        }

        let mut terminals = 0;
        if let Some(destination) = &self.destination {
            terminals += 1;
            if !is_valid_url(destination) {
                return Err(ConfigError::invalid(format!(
                    "invalid destination url '{destination}'"
                )));
            }
        }
        if let Some(directory) = &self.directory {
            terminals += 1;
            if !Path::new(directory).is_dir() {
                return Err(ConfigError::invalid(format!(
                    "invalid directory path '{directory}'"
                )));
            }
        }
        if let Some(backend) = &self.backend {
            terminals += 1;
            backend.validate()?;
        }
        if terminals == 0 {
            return Err(ConfigError::invalid(
                "endpoint must have a destination, directory or backend",
            ));
        }
        if terminals > 1 {
            return Err(ConfigError::invalid(
                "destination, directory and backend are mutually exclusive",
            ));
        }

        if let Some(openapi) = &self.openapi {
            if openapi.is_empty() || !is_readable_file(openapi) {
                return Err(ConfigError::invalid("invalid openapi spec path"));
            }
        }

        for rule in &self.ratelimits {
            parse_limit_rule(rule)?;
        }

        for check in &self.checks {
            check.validate()?;
        }

        Ok(())
    }
}

impl BackendConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_BALANCE_POLICIES.contains(&self.balance_policy.as_str()) {
            return Err(ConfigError::invalid(format!(
                "balance policy '{}' is not supported",
                self.balance_policy
            )));
        }

        if self.servers.is_empty() {
            return Err(ConfigError::invalid("backend requires at least one server"));
        }

        for server in &self.servers {
            if !is_valid_url(&server.url) {
                return Err(ConfigError::invalid(format!(
                    "invalid backend server url '{}'",
                    server.url
                )));
            }
        }

        Ok(())
    }
}

impl CheckConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("check requires a name"));
        }

        crate::cron::Schedule::parse(&self.cron)
            .map_err(|e| ConfigError::invalid(format!("invalid check cron expression: {e}")))?;

        if !is_valid_url(&self.url) {
            return Err(ConfigError::invalid("invalid check url"));
        }

        if !HTTP_METHODS.contains(&self.method.to_uppercase().as_str()) {
            return Err(ConfigError::invalid(format!(
                "invalid check method '{}'",
                self.method
            )));
        }

        Ok(())
    }
}

fn parse_version(s: &str) -> Option<(u64, u64, u64)> {
    let mut parts = s.trim().splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

fn is_readable_file(path: &str) -> bool {
    !path.is_empty() && Path::new(path).is_file()
}

fn is_valid_url(s: &str) -> bool {
    match s.parse::<Uri>() {
        Ok(uri) => uri.scheme().is_some() && uri.authority().is_some(),
        Err(_) => false,
    }
}

/// Accepts `localhost`, IP literals and dotted domain names up to 253 chars.
fn is_valid_hostname(hostname: &str) -> bool {
    let hostname = hostname.trim();

    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }

    if hostname == "localhost" {
        return true;
    }

    if hostname.parse::<IpAddr>().is_ok() {
        return true;
    }

    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    for (i, label) in labels.iter().enumerate() {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        let last = i == labels.len() - 1;
        if last {
            // TLD: alphabetic, at least two chars
            if label.len() < 2 || !label.chars().all(|c| c.is_ascii_alphabetic()) {
                return false;
            }
        } else {
            if !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return false;
            }
            if label.starts_with('-') || label.ends_with('-') {
                return false;
            }
        }
    }

    true
}
