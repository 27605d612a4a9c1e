use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use futures_util::future::join_all;
use log::info;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::modbus::ModbusTcpClient;
use crate::output::formatter_for;
use crate::services::{BatchWriter, DevicePoller, PollOutcome, PollerOptions};
use crate::storage::MemorySink;

pub fn build_cli() -> Command {
    Command::new("counter-ingest")
        .version(crate::VERSION)
        .about("Polls Modbus TCP counter modules and writes rates to a time-series store")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("config.toml")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .help("Log filter when RUST_LOG is not set"),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .value_parser(["console", "json"])
                .default_value("console")
                .help("Output format for readings and health"),
        )
        .arg(
            Arg::new("echo")
                .long("echo")
                .action(ArgAction::SetTrue)
                .help("Print every reading as it is produced"),
        )
        .subcommand(Command::new("run").about("Run the acquisition pipeline (default)"))
        .subcommand(Command::new("test").about("Poll every device once and print the readings"))
        .subcommand(Command::new("validate").about("Validate the configuration file"))
        .subcommand(
            Command::new("init-config")
                .about("Write a sample configuration file")
                .arg(Arg::new("path").required(true).value_name("PATH")),
        )
}

pub fn load_config(path: &str) -> Result<Config> {
    Config::load(path).with_context(|| format!("failed to load configuration from {}", path))
}

/// Handle the one-shot subcommands. Returns `Ok(true)` when one ran and the process
/// should exit, `Ok(false)` to continue into the pipeline.
pub async fn handle_subcommands(matches: &ArgMatches) -> Result<bool> {
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");
    let format = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("console");

    match matches.subcommand() {
        Some(("init-config", sub)) => {
            let path = sub
                .get_one::<String>("path")
                .context("init-config needs a path")?;
            init_config(Path::new(path))?;
            Ok(true)
        }
        Some(("validate", _)) => {
            let config = load_config(config_path)?;
            print_summary(&config);
            Ok(true)
        }
        Some(("test", _)) => {
            let config = load_config(config_path)?;
            test_devices(&config, format).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    Config::sample().save_to_file(path)?;
    println!("✅ Sample configuration written to {}", path.display());
    Ok(())
}

fn print_summary(config: &Config) {
    println!("✅ Configuration is valid");
    println!(
        "   collector: {} ({})",
        config.collector.name, config.collector.instance_id
    );
    println!("   sink: {:?}, measurement '{}'", config.sink.kind, config.sink.measurement);
    for device in &config.devices {
        println!(
            "   📟 {} at {} unit {} every {:?}",
            device.device_id,
            device.address(),
            device.unit_id,
            device.poll_interval()
        );
        for channel in &device.channels {
            println!(
                "      ch{} registers {}..{} x{} {}{}",
                channel.channel_number,
                channel.start_register,
                channel.end_register(),
                channel.scale_factor,
                channel.unit,
                if channel.enabled { "" } else { " (disabled)" }
            );
        }
    }
    println!(
        "   {} device(s), {} enabled channel(s)",
        config.devices.len(),
        config.enabled_channel_count()
    );
}

/// Poll every device once, concurrently. Readings are only printed, never written.
async fn test_devices(config: &Config, format: &str) -> Result<()> {
    info!("🔍 Testing {} device(s)...", config.devices.len());
    let formatter = formatter_for(format);
    let options = PollerOptions::from_config(config);
    // Never spawned, it only absorbs what the pollers emit
    let writer = BatchWriter::new(&config.writer, Arc::new(MemorySink::new()));

    let polls = config.devices.iter().map(|device| {
        let client = ModbusTcpClient::new(device.address(), device.timeout());
        let mut poller = DevicePoller::new(device.clone(), Box::new(client), writer.handle(), &options);
        async move {
            let outcome: PollOutcome = poller.poll_once().await;
            let snapshot = poller.health().clone();
            (outcome, snapshot)
        }
    });
    let results = join_all(polls).await;

    let header = formatter.format_header();
    if !header.is_empty() {
        println!("{}", header);
    }
    let mut failed = Vec::new();
    let mut snapshots = Vec::with_capacity(results.len());
    for (outcome, snapshot) in results {
        if !outcome.readings.is_empty() {
            println!("{}", formatter.format_readings(&outcome.readings));
        }
        if !outcome.is_success() {
            failed.push(snapshot.device_id.clone());
        }
        snapshots.push(snapshot);
    }
    println!("{}", formatter.format_health(&snapshots, None));

    if !failed.is_empty() {
        bail!("{} device(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
