//! Two-level request routing: host table, then path trie
//!
//! Built once from the validated configuration. Each service domain maps
//! to a path trie whose values are fully assembled handler chains; lookup
//! is an exact host match followed by a longest-prefix path match.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::anomaly::{AnomalyConfig, AnomalyDetector};
use crate::balancer::Balancer;
use crate::cache::ResponseCache;
use crate::config::{Config, EndpointConfig, ServiceConfig};
use crate::error::ConfigError;
use crate::files::FilesHandler;
use crate::handler::{ArcHandler, Chain};
use crate::middleware;
use crate::pathtree::Trie;
use crate::proxy::{ProxyHandler, UpstreamClient};

/// Immutable routing table: (host, path) to handler chain.
pub struct Router {
    hosts: HashMap<String, Trie<ArcHandler>>,
}

impl Router {
    /// Assemble every route from the configuration.
    pub fn build(
        config: &Config,
        client: UpstreamClient,
        cache: Arc<ResponseCache>,
    ) -> Result<Self, ConfigError> {
        let mut hosts = HashMap::new();
        let secure_cookies = config.ssl.enabled();

        for service in &config.services {
            let trie = hosts
                .entry(clean_host(&service.domain))
                .or_insert_with(Trie::new);

            // One detector per service: all its endpoints share the model
            let detector = service
                .anomaly_detection
                .as_ref()
                .filter(|a| a.active)
                .map(|a| {
                    Arc::new(AnomalyDetector::new(
                        AnomalyConfig {
                            header_name: a.header_name.clone(),
                            threshold: a.threshold_for_rating,
                            min_score: f64::from(a.min_score),
                            max_score: f64::from(a.max_score),
                        },
                        secure_cookies,
                    ))
                });

            for endpoint in &service.endpoints {
                let handler = build_route(
                    service,
                    endpoint,
                    client.clone(),
                    Arc::clone(&cache),
                    detector.clone(),
                )?;
                trie.insert(&endpoint.path.to_lowercase(), handler);
            }
        }

        Ok(Self { hosts })
    }

    /// Resolve a request to its handler, or `None` for a route miss.
    pub fn lookup(&self, host: &str, path: &str) -> Option<ArcHandler> {
        let trie = self.hosts.get(&clean_host(host))?;
        let (_, handler) = trie.search(&path.to_lowercase())?;
        Some(Arc::clone(handler))
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

/// Lowercase and strip a port suffix from a host value.
fn clean_host(host: &str) -> String {
    let lowered = host.to_lowercase();
    match lowered.rfind(':') {
        Some(i) => lowered[..i].to_string(),
        None => lowered,
    }
}

/// Build one endpoint's terminal and wrap it in the route's middleware
/// stack. Middlewares are added outermost-first.
fn build_route(
    service: &ServiceConfig,
    endpoint: &EndpointConfig,
    client: UpstreamClient,
    cache: Arc<ResponseCache>,
    detector: Option<Arc<AnomalyDetector>>,
) -> Result<ArcHandler, ConfigError> {
    let terminal: ArcHandler = if let Some(destination) = &endpoint.destination {
        Arc::new(ProxyHandler::new(client, destination)?)
    } else if let Some(directory) = &endpoint.directory {
        Arc::new(FilesHandler::new(directory.as_str(), &endpoint.path))
    } else if let Some(backend) = &endpoint.backend {
        Arc::new(Balancer::new(
            client,
            &backend.balance_policy,
            &backend.servers,
        )?)
    } else {
        // Config validation guarantees exactly one terminal
        return Err(ConfigError::invalid(format!(
            "endpoint '{}' on '{}' has no terminal",
            endpoint.path, service.domain
        )));
    };

    let mut chain = Chain::new();

    chain.add(middleware::logging::middleware());
    chain.add(middleware::trace::middleware());
    chain.add(middleware::timeout::middleware(Duration::from_secs(
        endpoint.timeout_secs(),
    )));
    chain.add(middleware::sizelimit::middleware(endpoint.max_request_size()));

    if !endpoint.ratelimits.is_empty() {
        let rules = endpoint
            .ratelimits
            .iter()
            .map(|r| middleware::ratelimit::parse_limit_rule(r))
            .collect::<Result<Vec<_>, _>>()?;
        chain.add(middleware::ratelimit::middleware(rules));
    }

    if let Some(headers) = &endpoint.headers {
        chain.add(middleware::headers::add_headers(headers.clone()));
    }

    if endpoint.gzip == Some(true) {
        chain.add(middleware::gzip::middleware());
    }

    if !endpoint.omit_headers.is_empty() {
        chain.add(middleware::headers::omit_headers(endpoint.omit_headers.clone()));
    }

    if endpoint.cache {
        chain.add(middleware::cache::middleware(cache));
    }

    if let Some(detector) = detector {
        chain.add(middleware::anomaly::middleware(detector));
    }

    Ok(chain.build(terminal))
}
