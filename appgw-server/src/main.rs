mod config;
mod host;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use appgw_core::{Gateway, GatewayBackends, ResolutionTable, TokioJobPool};
use appgw_telemetry::{Aggregator, TelemetryOptions};

use config::GatewayConfig;
use host::{DevInterfaces, EchoHandler, LoopbackUpstream, TokenAuthenticator, TracingSink};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let table = match ResolutionTable::from_rules(config.resolution.clone()) {
        Ok(table) => Arc::new(table),
        Err(err) => {
            error!(%err, "failed to load resolution table");
            std::process::exit(1);
        }
    };
    info!(rules = table.len(), endpoint = %config.endpoint, "configuration loaded");

    let telemetry = Aggregator::new(
        Arc::new(TracingSink),
        TelemetryOptions {
            reporting_interval: Duration::from_secs(config.telemetry.reporting_interval_secs),
            cache_threshold: config.telemetry.cache_threshold,
            format: config.telemetry.format,
        },
    );
    let flush_cancel = CancellationToken::new();
    let flush_task = telemetry.spawn_flush_task(flush_cancel.clone());

    let gateway = Gateway::new(
        table,
        config.subscription_suffix.clone(),
        GatewayBackends {
            authenticator: Arc::new(TokenAuthenticator::new(config.tokens.clone())),
            interfaces: Arc::new(DevInterfaces::new(Arc::new(EchoHandler))),
            upstream: Arc::new(LoopbackUpstream::default()),
        },
        telemetry.clone(),
        Arc::new(TokioJobPool::default()),
    );

    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            gateway.stop();
        });
    }

    let result = gateway.serve(&config.endpoint).await;

    // Final telemetry flush after the connection plane is down.
    flush_cancel.cancel();
    let _ = flush_task.await;

    if let Err(err) = result {
        error!(%err, "gateway terminated");
        std::process::exit(1);
    }
    info!("gateway stopped");
}

/// Wait for a shutdown signal (Ctrl-C or SIGTERM on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}
