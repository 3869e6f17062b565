//! Instrument recorder CLI.
//!
//! # Usage
//!
//! ```bash
//! # Record every enabled device until Ctrl-C
//! daq_recorder --config config/recorder.toml run
//!
//! # Record for a fixed time
//! daq_recorder run --duration 10m
//!
//! # Check storage and instrument identities without recording
//! daq_recorder check
//!
//! # Print the wire string of a command
//! daq_recorder build measure_frequency channel=2 expected=1e7 resolution=MIN
//!
//! # List the command catalog
//! daq_recorder commands
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use daq_recorder::command::{fs740, Arg};
use daq_recorder::config::{RecorderConfig, DEFAULT_CONFIG_PATH};
use daq_recorder::logging;
use daq_recorder::supervisor::RecorderSupervisor;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "daq_recorder")]
#[command(version)]
#[command(about = "Poll instruments on a schedule and record their readings", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start all enabled devices and record until interrupted
    Run {
        /// Stop automatically after this long (e.g. "90s", "2h")
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        duration: Option<Duration>,
    },
    /// Ping storage and verify every enabled device's identity
    Check,
    /// Validate arguments and print a command's wire string
    Build {
        /// Catalog command name
        name: String,
        /// Arguments as KEY=VALUE
        #[arg(value_name = "KEY=VALUE")]
        args: Vec<String>,
    },
    /// List the command catalog
    Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Build { name, args } => {
            logging::init(if cli.verbose { "debug" } else { "warn" });
            build(name, args)
        }
        Command::Commands => {
            list_commands();
            Ok(())
        }
        Command::Run { duration } => {
            let config = load_config(&cli)?;
            run(&config, *duration).await
        }
        Command::Check => {
            let config = load_config(&cli)?;
            check(&config).await
        }
    }
}

fn load_config(cli: &Cli) -> Result<RecorderConfig> {
    let config = RecorderConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let level = if cli.verbose {
        "debug"
    } else {
        config.application.log_level.as_str()
    };
    logging::init(level);
    info!(
        application = %config.application.name,
        devices = config.devices.len(),
        "configuration loaded"
    );
    Ok(config)
}

async fn run(config: &RecorderConfig, duration: Option<Duration>) -> Result<()> {
    let mut supervisor = RecorderSupervisor::from_config(config)?;
    supervisor.start().await.context("Failed to start recording")?;
    println!(
        "Recording {} device(s); press Ctrl-C to stop",
        config.enabled_devices().len()
    );

    match duration {
        Some(limit) => {
            tokio::select! {
                _ = tokio::time::sleep(limit) => info!("run duration elapsed"),
                signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl-C")?,
            }
        }
        None => tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?,
    }

    supervisor.stop().await.context("Failed to stop cleanly")?;
    println!("{}", serde_json::to_string_pretty(&supervisor.status())?);
    Ok(())
}

async fn check(config: &RecorderConfig) -> Result<()> {
    let supervisor = RecorderSupervisor::from_config(config)?;
    let reports = supervisor.check().await?;
    for report in reports {
        println!("{:<16} OK  {}", report.device, report.identity);
    }
    Ok(())
}

fn build(name: &str, raw_args: &[String]) -> Result<()> {
    let spec = fs740::catalog()
        .get(name)
        .ok_or_else(|| anyhow!("Unknown command '{}'. Run `daq_recorder commands`.", name))?;

    let mut args = BTreeMap::new();
    for raw in raw_args {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("Argument '{}' is not KEY=VALUE", raw))?;
        let value: Arg = value.parse()?;
        args.insert(key.trim().to_string(), value);
    }

    println!("{}", spec.build_named(&args)?);
    Ok(())
}

fn list_commands() {
    for spec in fs740::catalog().iter() {
        let params: Vec<&str> = spec.params().iter().map(|p| p.name()).collect();
        println!(
            "{:<24} {:<40} {}",
            spec.name(),
            spec.template(),
            if params.is_empty() {
                spec.description().to_string()
            } else {
                format!("[{}] {}", params.join(", "), spec.description())
            }
        );
    }
}
