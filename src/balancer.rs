//! Weighted load balancing across multiple origins
//!
//! Three selection policies behind one `next_index` seam: weighted
//! round-robin, weighted random, and least-latency with live measurement.
//! Origin URLs are parsed once at construction; weights below 1 are
//! coerced to 1.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use hyper::Request;
use parking_lot::Mutex;
use rand::Rng;

use crate::config::BackendServer;
use crate::error::{ConfigError, GatewayBody};
use crate::handler::{BoxFuture, Handler};
use crate::proxy::{forward, UpstreamClient, UpstreamTarget};

/// A back-end server the balancer may dispatch to.
pub struct Origin {
    target: UpstreamTarget,
    weight: i64,
    /// Original URL string, used as the latency-table key.
    url: String,
}

/// Origin selection policy.
pub enum Policy {
    /// Weighted round-robin driven by a wrapping cursor.
    RoundRobin { cursor: Mutex<i64>, weight_sum: i64 },
    /// Weighted random sampling.
    Random { weight_sum: i64 },
    /// Origin with the lowest last-observed latency; zero means unmeasured
    /// and wins. The most recent observation replaces the previous one.
    LeastLatency { latencies: Arc<DashMap<String, i64>> },
}

/// Terminal handler spreading requests over weighted origins.
pub struct Balancer {
    client: UpstreamClient,
    origins: Vec<Origin>,
    policy: Policy,
}

impl Balancer {
    pub fn new(
        client: UpstreamClient,
        policy_name: &str,
        servers: &[BackendServer],
    ) -> Result<Self, ConfigError> {
        if servers.is_empty() {
            return Err(ConfigError::invalid("backend requires at least one server"));
        }

        let mut origins = Vec::with_capacity(servers.len());
        for server in servers {
            origins.push(Origin {
                target: UpstreamTarget::parse(&server.url)?,
                weight: i64::from(server.weight.max(1)),
                url: server.url.clone(),
            });
        }

        let weight_sum: i64 = origins.iter().map(|o| o.weight).sum();

        let policy = match policy_name {
            "round-robin" => Policy::RoundRobin {
                cursor: Mutex::new(0),
                weight_sum,
            },
            "random" => Policy::Random { weight_sum },
            "least-latency" => {
                let latencies = DashMap::new();
                for origin in &origins {
                    latencies.insert(origin.url.clone(), 0i64);
                }
                Policy::LeastLatency {
                    latencies: Arc::new(latencies),
                }
            }
            other => {
                return Err(ConfigError::invalid(format!(
                    "balance policy '{other}' is not supported"
                )))
            }
        };

        Ok(Self {
            client,
            origins,
            policy,
        })
    }

    /// Pick the next origin according to the policy.
    pub fn next_index(&self) -> usize {
        match &self.policy {
            Policy::RoundRobin { cursor, weight_sum } => {
                let mut cursor = cursor.lock();
                let mut index = *cursor;
                for (i, origin) in self.origins.iter().enumerate() {
                    index -= origin.weight;
                    if index < 0 {
                        *cursor += 1;
                        return i;
                    }
                }
                // cursor swept past every weight: wrap and restart the cycle
                *cursor = (*cursor % weight_sum) + 1;
                0
            }
            Policy::Random { weight_sum } => {
                let mut sample = rand::thread_rng().gen_range(0..*weight_sum);
                for (i, origin) in self.origins.iter().enumerate() {
                    sample -= origin.weight;
                    if sample <= 0 {
                        return i;
                    }
                }
                0
            }
            Policy::LeastLatency { latencies } => {
                let mut best = 0;
                let mut best_latency = i64::MAX;
                for (i, origin) in self.origins.iter().enumerate() {
                    let latency = latencies
                        .get(&origin.url)
                        .map(|entry| *entry)
                        .unwrap_or(0);
                    if latency < best_latency {
                        best = i;
                        best_latency = latency;
                    }
                }
                best
            }
        }
    }

    fn record_latency(&self, url: &str, micros: i64) {
        if let Policy::LeastLatency { latencies } = &self.policy {
            latencies.insert(url.to_string(), micros);
        }
    }

    #[cfg(test)]
    fn origin_url(&self, index: usize) -> &str {
        &self.origins[index].url
    }
}

impl Handler for Balancer {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let index = self.next_index();
        let client = self.client.clone();
        let target = self.origins[index].target.clone();
        let url = self.origins[index].url.clone();
        let latencies = match &self.policy {
            Policy::LeastLatency { latencies } => Some(Arc::clone(latencies)),
            _ => None,
        };

        Box::pin(async move {
            let start = Instant::now();
            let response = forward(&client, &target, req).await;
            // last writer wins, success and failure both count
            if let Some(latencies) = latencies {
                let micros = start.elapsed().as_micros() as i64;
                latencies.insert(url, micros);
            }
            response
        })
    }
}
