use anyhow::{bail, Result};
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use counter_ingest::cli::{build_cli, handle_subcommands, load_config};
use counter_ingest::config::Config;
use counter_ingest::devices::HealthHandle;
use counter_ingest::output::{formatter_for, HealthReport, ReadingFormatter};
use counter_ingest::services::{DevicePool, WriterHandle, WriterStats};
use counter_ingest::{build_sink, DeviceHealthSnapshot};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if handle_subcommands(&matches).await? {
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");
    let format = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("console");
    let config = load_config(config_path)?;

    info!(
        "🚀 counter-ingest {} starting: {} ({})",
        counter_ingest::VERSION,
        config.collector.name,
        config.collector.instance_id
    );

    let sink = build_sink(&config).await?;
    info!("💾 Writing to {} sink", sink.name());
    let pool = DevicePool::start(&config, Arc::clone(&sink));

    let (stop_tx, stop_rx) = watch::channel(false);
    let echo = matches
        .get_flag("echo")
        .then(|| spawn_echo(pool.subscribe(), formatter_for(format), stop_rx.clone()));
    let reporter = spawn_reporter(
        &config,
        pool.health_handles(),
        pool.writer(),
        formatter_for(format),
        stop_rx,
    );

    wait_for_signal().await;
    info!("🛑 Shutdown requested");

    stop_tx.send_replace(true);
    let report = pool.stop(config.shutdown.timeout()).await;
    sink.close().await;
    for task in echo.into_iter().chain(std::iter::once(reporter)) {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    let writer = report.writer.unwrap_or_default();
    write_report(&config, report.stopped.clone(), writer).await;
    info!(
        "📊 Final: {} reading(s) written, {} dropped, {} still buffered",
        writer.written, writer.dropped, writer.buffered
    );

    if !report.is_clean() {
        bail!(
            "shutdown incomplete: abandoned loops [{}]",
            report.abandoned.join(", ")
        );
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {}", e);
    }
}

fn spawn_echo(
    mut readings: broadcast::Receiver<counter_ingest::DeviceReading>,
    formatter: Box<dyn ReadingFormatter>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let header = formatter.format_header();
        if !header.is_empty() {
            println!("{}", header);
        }
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                received = readings.recv() => match received {
                    Ok(reading) => println!("{}", formatter.format_reading(&reading)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Echo fell behind, skipped {} reading(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn spawn_reporter(
    config: &Config,
    health: Vec<HealthHandle>,
    writer: WriterHandle,
    formatter: Box<dyn ReadingFormatter>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let config = config.clone();
    let period = Duration::from_millis(config.health.report_interval_ms.max(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let snapshots: Vec<DeviceHealthSnapshot> = health.iter().map(HealthHandle::current).collect();
                    let stats = writer.stats();
                    info!("{}", formatter.format_health(&snapshots, Some(&stats)));
                    write_report(&config, snapshots, stats).await;
                }
            }
        }
    })
}

async fn write_report(config: &Config, devices: Vec<DeviceHealthSnapshot>, writer: WriterStats) {
    let Some(path) = config.health.report_path.as_deref() else {
        return;
    };
    let report = HealthReport {
        collector: config.collector.name.clone(),
        instance_id: config.collector.instance_id.clone(),
        generated_at: Utc::now(),
        devices,
        writer,
    };
    if let Err(e) = report.write_to(path).await {
        warn!("Failed to write health report to {}: {}", path.display(), e);
    }
}
