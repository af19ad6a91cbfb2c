//! Scheduled HTTP health checks
//!
//! Every check configured on a route becomes a cron job. A fired check
//! sends a one-shot request with the configured method, headers and
//! timeout; anything but a 200 response counts as a failure. Failures can
//! spawn an operator-supplied command with `$date`, `$error` and
//! `$check_name` expanded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::cron::{ScheduleError, Scheduler};

/// Delay before the first check fires after startup.
const START_DELAY: Duration = Duration::from_secs(5);

/// One health probe definition.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub cron: String,
    pub url: String,
    pub method: String,
    pub timeout: Duration,
    pub headers: HashMap<String, String>,
    pub on_failure: String,
}

/// Runs configured checks on their cron schedules.
pub struct Checker {
    checks: Vec<Check>,
    scheduler: Option<Scheduler>,
}

impl Checker {
    /// Collect every check defined across the route set.
    pub fn from_services(services: &[ServiceConfig]) -> Self {
        let mut checks = Vec::new();
        for service in services {
            for endpoint in &service.endpoints {
                for check in &endpoint.checks {
                    checks.push(Check {
                        name: check.name.clone(),
                        cron: check.cron.clone(),
                        url: check.url.clone(),
                        method: check.method.clone(),
                        timeout: Duration::from_secs(check.timeout),
                        headers: check.headers.clone(),
                        on_failure: check.on_failure.clone(),
                    });
                }
            }
        }

        Self {
            checks,
            scheduler: None,
        }
    }

    pub fn check_count(&self) -> usize {
        self.checks.len()
    }

    /// Register every check with the scheduler and start it. Invalid cron
    /// expressions fail here, before the gateway begins serving.
    pub fn start(&mut self) -> Result<(), ScheduleError> {
        let mut scheduler = Scheduler::new().with_delay(START_DELAY);
        let client = reqwest::Client::new();

        for check in &self.checks {
            let check = Arc::new(check.clone());
            let client = client.clone();
            let cron = check.cron.clone();
            scheduler.add(&Uuid::new_v4().to_string(), &cron, move || {
                let check = Arc::clone(&check);
                let client = client.clone();
                async move {
                    run_check(&client, &check).await;
                }
            })?;
        }

        scheduler.start()?;
        info!(checks = self.checks.len(), "Started running automated checks");
        self.scheduler = Some(scheduler);

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
    }
}

/// Execute one probe and handle a failure.
async fn run_check(client: &reqwest::Client, check: &Check) {
    if let Err(reason) = probe(client, check).await {
        warn!(check = %check.name, error = %reason, "Check failed");
        if !check.on_failure.is_empty() {
            if let Err(e) = spawn_failure_command(check, &reason) {
                warn!(check = %check.name, error = %e, "Failed to spawn on_failure command");
            }
        }
    }
}

/// A check fails on request build errors, transport errors, timeouts, and
/// any status other than 200.
async fn probe(client: &reqwest::Client, check: &Check) -> Result<(), String> {
    let method = reqwest::Method::from_bytes(check.method.to_uppercase().as_bytes())
        .map_err(|_| format!("invalid method '{}'", check.method))?;

    let mut request = client
        .request(method, &check.url)
        .timeout(check.timeout);
    for (name, value) in &check.headers {
        request = request.header(name, value);
    }

    let response = request.send().await.map_err(|e| e.to_string())?;

    if response.status().as_u16() != 200 {
        return Err(format!(
            "expected status code 200 got {}",
            response.status().as_u16()
        ));
    }

    Ok(())
}

/// Expand the failure template and run it as a detached child process.
fn spawn_failure_command(check: &Check, error: &str) -> std::io::Result<()> {
    let date = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let command = check
        .on_failure
        .replace("$date", &date)
        .replace("$error", error)
        .replace("$check_name", &check.name);

    let mut parts = command.split_whitespace();
    let program = match parts.next() {
        Some(program) => program,
        None => return Ok(()),
    };

    tokio::process::Command::new(program).args(parts).spawn()?;
    Ok(())
}
