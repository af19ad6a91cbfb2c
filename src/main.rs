use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use routegate::cache::{ResponseCache, JANITOR_INTERVAL};
use routegate::config::Config;
use routegate::healthcheck::Checker;
use routegate::proxy::build_upstream_client;
use routegate::router::Router;
use routegate::server::{tls_acceptor, GatewayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        anyhow::anyhow!(e)
    })?;

    info!(
        path = %config_path.display(),
        services = config.services.len(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Build the routing table
    let client = build_upstream_client();
    let cache = Arc::new(ResponseCache::new());
    let router = Arc::new(Router::build(&config, client, Arc::clone(&cache))?);
    let _janitor = cache.start_janitor(JANITOR_INTERVAL, shutdown_rx.clone());

    // Start health checks; an invalid cron expression is fatal here
    let mut checker = Checker::from_services(&config.services);
    if checker.check_count() > 0 {
        checker.start()?;
    }

    // Create the server, with TLS iff both certificate files are present
    let bind_target = format!("{}:{}", config.host, config.port);
    let bind_addr = match bind_target.parse() {
        Ok(addr) => addr,
        // hostname bind targets (e.g. "localhost") resolve through DNS
        Err(_) => tokio::net::lookup_host(&bind_target)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Cannot resolve bind address '{}'", bind_target))?,
    };

    let mut server = GatewayServer::new(bind_addr, router, shutdown_rx);
    if let (Some(certfile), Some(keyfile)) = (&config.ssl.certfile, &config.ssl.keyfile) {
        server = server.with_tls(tls_acceptor(certfile, keyfile)?);
        info!(certfile = %certfile, keyfile = %keyfile, "TLS enabled");
    }

    // Shut down on ctrl-c
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run().await?;

    checker.stop();
    info!("Shutdown complete");
    Ok(())
}
