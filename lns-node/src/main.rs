use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};

use lns_node::channel::{nats, NatsChannel};
use lns_node::config::LoggingConfig;
use lns_node::events::NatsTelemetry;
use lns_node::feed::run_uplink_feed;
use lns_node::{LnsConfig, LnsNode};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/default".to_string());

    // Load configuration from file if available, otherwise use defaults
    let (config, load_error) = match LnsConfig::from_file(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (LnsConfig::default(), Some(e)),
    };

    init_tracing(&config.logging);
    info!("Starting LNS node v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!(path = %config_path, "Configuration loaded"),
        Some(e) => warn!("Failed to load config file {}: {}, using defaults", config_path, e),
    }

    if config.metrics.enabled {
        start_metrics_exporter(&config)?;
    }

    let mut builder = LnsNode::builder(config.clone());
    if config.nats.enabled {
        let client = nats::connect(&config.nats.url)
            .await
            .context("Failed to connect to NATS")?;
        builder = builder
            .channel(Arc::new(NatsChannel::new(
                client.clone(),
                &config.nats.subject_prefix,
            )))
            .telemetry(Arc::new(NatsTelemetry::new(
                client,
                &config.nats.subject_prefix,
                &config.platform.instance_id,
            )));
    } else {
        info!("NATS disabled, cross-instance calls stay in process");
    }

    let mut node = builder.build().context("Failed to build node")?;
    node.start().await.context("Failed to start node")?;

    // one JSON uplink record per stdin line
    let reader = tokio::spawn(run_uplink_feed(
        BufReader::new(tokio::io::stdin()),
        node.dispatcher().clone(),
    ));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        result = reader => {
            match result {
                Ok(Ok(stats)) => info!(dispatched = stats.dispatched, "Uplink input closed"),
                Ok(Err(e)) => error!(error = %e, "Uplink reader failed"),
                Err(e) => error!(error = %e, "Uplink reader task panicked"),
            }
        }
    }

    node.shutdown().await.context("Failed to shut down node")?;
    info!("LNS node stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("lns_node={}", logging.level).into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn start_metrics_exporter(config: &LnsConfig) -> Result<()> {
    let listen_addr = config
        .metrics
        .listen_addr()
        .context("Invalid metrics listen address")?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe_counter!("uplinks_received", "Uplinks handed to the dispatcher");
    describe_counter!("uplinks_processed", "Uplinks fully applied");
    describe_counter!("uplinks_duplicate_dropped", "Duplicate uplinks dropped");
    describe_counter!("uplinks_not_found", "Uplinks from unknown device addresses");
    describe_counter!("uplinks_transient_failure", "Uplinks abandoned after the retry ceiling");
    describe_counter!("uplinks_failed", "Uplinks rejected by coordination or failed internally");
    describe_counter!("coordination_attempts", "Bundled coordination attempts");
    describe_counter!("coordination_retries", "Bundled coordination retries");
    describe_counter!("remote_calls_published", "Remote calls published to other instances");
    describe_counter!("remote_calls_received", "Remote calls received from other instances");
    describe_gauge!("registry_sessions", "Device sessions held in memory");

    info!(metrics_addr = %listen_addr, "Prometheus metrics exporter started");
    Ok(())
}
