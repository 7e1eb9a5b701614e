//! Command-line interface for hmibridge.

mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hmibridge_core::config::env_vars;
use hmibridge_core::{BridgeConfig, Lifecycle};
use hmibridge_devices::discovery::slugify;
use hmibridge_devices::hmi::stream::{decode_body, decode_values};
use hmibridge_devices::hmi::{build_languages, DeviceSession, HmiClient, PageParser};
use hmibridge_devices::{Bridge, BridgeSettings, DiscoveryContext, MqttBus};

/// hmibridge - Boiler HMI console to MQTT bridge.
#[derive(Parser, Debug)]
#[command(name = "hmibridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform (defaults to `run`).
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (TOML, or JSON when the name ends in `.json`).
    #[arg(short, long, global = true, env = env_vars::CONFIG)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until terminated.
    Run,
    /// Parse one console page and print its model as JSON.
    Inspect {
        /// Page name, e.g. HMI00001.cgi.
        page: String,
    },
    /// Decode one telemetry endpoint and print the samples as JSON.
    Read {
        /// Endpoint name, e.g. HMI00001Read.cgi.
        endpoint: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = BridgeConfig::load(args.config.as_deref())?;
    config.validate()?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_bridge(config).await,
        Command::Inspect { page } => inspect_page(&config, &page).await,
        Command::Read { endpoint } => read_endpoint(&config, &endpoint).await,
    }
}

fn init_tracing(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("hmibridge={}", default_level))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_bridge(config: BridgeConfig) -> Result<()> {
    let session = Arc::new(HmiClient::from_config(&config)?);
    let discovery = DiscoveryContext::from_config(&config);
    let client_id = format!("hmibridge-{}-{}", slugify(&discovery.host), std::process::id());
    let (bus, inbound) = MqttBus::connect(&config.mqtt, &client_id, &discovery.status_topic());

    let lifecycle = Lifecycle::new();
    let signals = shutdown::spawn_signal_handler(lifecycle.clone());

    let settings = BridgeSettings::from_config(&config);
    tracing::info!(
        category = "config",
        device = %session.base_url(),
        pages = ?settings.pages,
        policy = settings.policy.name(),
        poll_interval_secs = settings.poll_interval.as_secs(),
        "Starting bridge"
    );

    let bridge = Arc::new(Bridge::new(session, Arc::new(bus), lifecycle, settings));
    bridge.announce_online().await?;
    let entities = bridge.configure().await?;
    tracing::info!(category = "config", entities, "Entities synchronized");

    bridge.run(inbound).await?;
    signals.abort();
    Ok(())
}

async fn inspect_page(config: &BridgeConfig, page: &str) -> Result<()> {
    let session = HmiClient::from_config(config)?;
    let table = build_languages(&session).await;
    let html = session.fetch(page).await?;

    let model = PageParser::new(config.language_index).parse(page, &html, &table);
    println!("{}", serde_json::to_string_pretty(&model)?);
    Ok(())
}

async fn read_endpoint(config: &BridgeConfig, endpoint: &str) -> Result<()> {
    let session = HmiClient::from_config(config)?;
    let bytes = session.fetch_bytes(endpoint).await?;

    let samples = decode_values(&decode_body(&bytes));
    println!("{}", serde_json::to_string_pretty(&samples)?);
    Ok(())
}
