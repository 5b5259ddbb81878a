//! market-aggregator binary entry point

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use market_aggregator::health::DEFAULT_FLUSH_OVERDUE_SECS;
use market_aggregator::server::{run_server, ServerState};
use market_aggregator::{
    Aggregator, Config, DriverSettings, ParquetSink, Pipeline, SubscriptionDriver,
};
use market_middleware::{redact_url, NatsTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_aggregator=info,market_middleware=info".into()),
        )
        .json()
        .init();

    let config = Config::parse();
    config.validate()?;

    info!(
        nats_url = %redact_url(&config.nats_url),
        subject = %config.subject,
        queue_group = %config.queue_group,
        batch_size = config.batch_size,
        quality_threshold = config.quality_threshold,
        output_path = ?config.output_path,
        "market-aggregator starting"
    );

    let transport = NatsTransport::connect(&config.nats_settings())
        .await
        .context("failed to create NATS client")?;

    let sink = ParquetSink::new(config.output_path.clone(), config.zstd_level)
        .context("failed to create Parquet sink")?;
    let pipeline = Pipeline::new(
        config.batch_size,
        Aggregator::new(config.quality_threshold),
        sink,
        config.retry_policy(),
    )?;
    let health = pipeline.health();

    let settings = DriverSettings {
        channel_capacity: config.channel_capacity,
        max_batch_age: config.max_batch_age,
        stats_interval: config.stats_interval,
    };
    let driver =
        SubscriptionDriver::subscribe(&transport, &config.subject, &config.queue_group, settings)
            .await
            .context("failed to join queue group")?;

    let shutdown = CancellationToken::new();

    if let Some(addr) = config.metrics_addr {
        // Overdue once several batch age windows pass without a flush
        let flush_overdue_secs = config
            .max_batch_age
            .as_secs()
            .saturating_mul(5)
            .max(DEFAULT_FLUSH_OVERDUE_SECS);
        let state = ServerState::new(config.subject.clone(), health, flush_overdue_secs);
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(addr, state, server_shutdown).await {
                error!(error = %e, addr = %addr, "Ops server failed");
            }
        });
    }

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!(error = %e, "Failed to listen for shutdown signals");
            return;
        }
        info!("Shutting down gracefully");
        signal_shutdown.cancel();
    });

    info!("Aggregator running, waiting for SIGTERM/SIGINT to stop");
    let result = driver.run(pipeline, shutdown.clone()).await;
    shutdown.cancel();

    match result {
        Ok(pipeline) => {
            info!(
                batches_flushed = pipeline.stats().batches_flushed,
                rows_written = pipeline.stats().rows_written,
                "Aggregator stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Aggregator failed");
            Err(e.into())
        }
    }
}

/// Listen for SIGTERM (Kubernetes pod termination) or ctrl-c.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("SIGINT received");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
