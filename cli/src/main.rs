// gattlink — BLE central command-line tool
//
// Cross-platform (macOS, Linux, Windows) front end for gattlink-core:
// find a peripheral, bring up a link and read, write or watch a
// characteristic.

mod config;
mod permissions;
mod radio;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use futures::StreamExt;
use gattlink_core::{
    BatteryLevel, Capability, ConnectionManager, ConnectionState, LinkConfig, RadioDriver,
    Readiness, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::permissions::DesktopPermissions;
use crate::radio::BtleplugRadio;

#[derive(Parser)]
#[command(name = "gattlink")]
#[command(about = "gattlink — BLE central connection manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Adapter index, overriding the configured one
    #[arg(long, global = true)]
    adapter: Option<usize>,

    /// Peripheral name to look for, overriding the configured target
    #[arg(long, global = true)]
    target: Option<String>,

    /// Refuse a radio capability, as a platform without the permission would
    #[arg(long, global = true, value_enum)]
    deny: Vec<CapabilityArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CapabilityArg {
    Scan,
    Connect,
}

impl From<CapabilityArg> for Capability {
    fn from(arg: CapabilityArg) -> Self {
        match arg {
            CapabilityArg::Scan => Capability::Scan,
            CapabilityArg::Connect => Capability::Connect,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List advertising peripherals
    Scan {
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },
    /// Connect to the target and report its battery level
    Battery {
        /// Keep the link up and print every notified level
        #[arg(short, long)]
        watch: bool,
    },
    /// Read a characteristic
    Read {
        characteristic: String,
        /// Service holding the characteristic (defaults to the configured one)
        #[arg(short, long)]
        service: Option<String>,
    },
    /// Write hex bytes to a characteristic
    Write {
        characteristic: String,
        payload: String,
        #[arg(short, long)]
        service: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = config::Config::load()?;
    // Overrides apply to this run only, never to the saved file
    if !matches!(cli.command, Commands::Config { .. }) {
        if let Some(adapter) = cli.adapter {
            settings.adapter_index = adapter;
        }
        if let Some(target) = &cli.target {
            settings.set("target_name", target)?;
        }
    }
    let permissions = cli
        .deny
        .iter()
        .fold(DesktopPermissions::new(), |gate, arg| gate.withhold((*arg).into()));

    match cli.command {
        Commands::Scan { seconds } => cmd_scan(&settings, Duration::from_secs(seconds)).await,
        Commands::Battery { watch } => cmd_battery(&settings, permissions, watch).await,
        Commands::Read {
            characteristic,
            service,
        } => cmd_read(&settings, permissions, &characteristic, service.as_deref()).await,
        Commands::Write {
            characteristic,
            payload,
            service,
        } => cmd_write(&settings, permissions, &characteristic, &payload, service.as_deref()).await,
        Commands::Config { action } => cmd_config(settings, action).await,
    }
}

async fn cmd_scan(settings: &config::Config, window: Duration) -> Result<()> {
    let radio = BtleplugRadio::open(settings.adapter_index).await?;
    let target = &settings.link.target;

    println!("{} ({}s)", "Scanning...".bold(), window.as_secs());
    println!();

    let mut advertisements = radio.start_scan(target).await?;
    let mut seen = HashSet::new();
    let deadline = tokio::time::Instant::now() + window;

    while let Ok(Some(advertisement)) =
        tokio::time::timeout_at(deadline, advertisements.next()).await
    {
        if !seen.insert(advertisement.peripheral.address().clone()) {
            continue;
        }
        let name = advertisement.peripheral.name().unwrap_or("(unnamed)");
        let marker = if target.matches(&advertisement) {
            "★".bright_yellow()
        } else {
            "•".bright_green()
        };
        let rssi = advertisement
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_default();
        println!(
            "  {} {:<24} {} {}",
            marker,
            name.bright_cyan(),
            advertisement.peripheral.address(),
            rssi.dimmed()
        );
    }

    drop(advertisements);
    radio.stop_scan().await?;

    println!();
    if seen.is_empty() {
        println!("{}", "No peripherals found.".dimmed());
    } else {
        println!("{} peripherals, {} marks {}", seen.len(), "★".bright_yellow(), target);
    }
    Ok(())
}

/// Bring up a link for `link` and report how it came up
async fn open_link(
    settings: &config::Config,
    permissions: DesktopPermissions,
    link: LinkConfig,
) -> Result<ConnectionManager> {
    let radio = BtleplugRadio::open(settings.adapter_index).await?;
    let manager = ConnectionManager::new(link, Arc::new(radio), Arc::new(permissions))?;

    println!("Looking for {}...", manager.config().target.to_string().bright_cyan());
    let outcome = manager.start().await.context("Failed to bring up the link")?;

    println!("  {} Connected to {}", "✓".green(), outcome.peripheral.to_string().bright_cyan());
    if let Readiness::Degraded(reason) = &outcome.readiness {
        println!("  {} {}", "!".yellow(), reason.to_string().yellow());
    }
    Ok(manager)
}

fn link_for(
    settings: &config::Config,
    characteristic: &str,
    service: Option<&str>,
) -> Result<LinkConfig> {
    let mut link = settings.link.clone();
    link.characteristic_uuid = config::parse_uuid(characteristic)?;
    if let Some(service) = service {
        link.service_uuid = config::parse_uuid(service)?;
    }
    link.validate()?;
    Ok(link)
}

async fn cmd_battery(
    settings: &config::Config,
    permissions: DesktopPermissions,
    watch: bool,
) -> Result<()> {
    let mut link = settings.link.clone();
    link.service_uuid = BATTERY_SERVICE_UUID;
    link.characteristic_uuid = BATTERY_LEVEL_UUID;

    let manager = open_link(settings, permissions, link).await?;
    let result = report_battery(&manager, watch).await;
    manager.dispose().await;
    result
}

async fn report_battery(manager: &ConnectionManager, watch: bool) -> Result<()> {
    let bytes = manager.read(BATTERY_LEVEL_UUID).await?;
    let level = BatteryLevel::from_bytes(&bytes).context("Malformed battery level")?;
    println!("{} {}", "Battery:".bold(), level.to_string().bright_green());

    if !watch {
        return Ok(());
    }
    if manager.is_degraded() {
        anyhow::bail!("Peripheral does not notify battery changes");
    }

    println!("{}", "Watching for changes (Ctrl-C to stop)".dimmed());
    let mut updates = manager.subscribe_notifications(BATTERY_LEVEL_UUID);
    let mut transitions = manager.subscribe_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            Some(update) = updates.recv() => match BatteryLevel::from_bytes(&update.value) {
                Some(level) => println!("  {} {}", "→".bright_blue(), level),
                None => tracing::warn!("Ignoring malformed battery value {:?}", update.value),
            },
            Some(change) = transitions.recv() => {
                if change.to == ConnectionState::Disconnected {
                    anyhow::bail!("Link lost");
                }
            }
        }
    }
}

async fn cmd_read(
    settings: &config::Config,
    permissions: DesktopPermissions,
    characteristic: &str,
    service: Option<&str>,
) -> Result<()> {
    let link = link_for(settings, characteristic, service)?;
    let uuid = link.characteristic_uuid;

    let manager = open_link(settings, permissions, link).await?;
    let result = manager.read(uuid).await;
    manager.dispose().await;

    let value = result?;
    println!("{} {}", uuid.to_string().bright_cyan(), hex::encode(&value).bright_yellow());
    Ok(())
}

async fn cmd_write(
    settings: &config::Config,
    permissions: DesktopPermissions,
    characteristic: &str,
    payload: &str,
    service: Option<&str>,
) -> Result<()> {
    let bytes = hex::decode(payload.trim_start_matches("0x")).context("Payload must be hex")?;
    let link = link_for(settings, characteristic, service)?;
    let uuid = link.characteristic_uuid;

    let manager = open_link(settings, permissions, link).await?;
    let result = manager.write(uuid, bytes.clone()).await;
    manager.dispose().await;

    result?;
    println!("{} Wrote {} bytes to {}", "✓".green(), bytes.len(), uuid.to_string().bright_cyan());
    Ok(())
}

async fn cmd_config(mut settings: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            settings.set(&key, &value)?;
            settings.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = settings.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown or unset config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in settings.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
