//! AeroPoint daemon
//!
//! Receiver mode brings up the enabled transport channels, filters their
//! reports through the active-source rule, and drives a virtual pointer.
//! The `peers` and `send` subcommands exercise the sender side: listing
//! discovered receivers and streaming motion to one of them.

mod config;
mod pointer;

use aeropoint_protocol::transport::{Channel, ChannelEvent};
use aeropoint_protocol::{
    ButtonFlags, DirectApply, DiscoveryRegistry, Interpolating, InterpolatingConfig, LanChannel,
    LanChannelConfig, MeshChannel, MeshChannelConfig, MotionPolicy, MotionReport, PointerOutput,
    RadioChannel, RadioChannelConfig, ReceiverArbitrator, ScreenBounds, SenderArbitrator,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use config::{Config, PolicyConfig};

/// AeroPoint daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "aeropoint-daemon")]
#[command(about = "AeroPoint wireless pointer daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run as a receiver, driving the local pointer (default)
    Receive,

    /// Discover receivers and list them
    Peers {
        /// How long to browse before printing, in seconds
        #[arg(short, long, default_value = "5")]
        wait: u64,
    },

    /// Connect to a receiver and stream synthetic motion (link check)
    Send {
        /// Qualified peer id as printed by `peers` (e.g. "mesh-<id>")
        target: String,

        /// Per-report horizontal delta
        #[arg(long, default_value = "2", allow_hyphen_values = true)]
        dx: i16,

        /// Per-report vertical delta
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        dy: i16,

        /// Number of reports to send
        #[arg(short, long, default_value = "100")]
        count: u32,

        /// Gap between reports in milliseconds
        #[arg(short, long, default_value = "10")]
        interval_ms: u64,
    },
}

/// Initialize logging based on CLI configuration
fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt().with_env_filter(filter).with_target(true);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}

/// Build the enabled transport channels from configuration
fn build_channels(config: &Config, device_id: &str) -> Vec<Arc<dyn Channel>> {
    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();

    if config.transports.enable_mesh {
        channels.push(Arc::new(MeshChannel::new(MeshChannelConfig {
            device_id: device_id.to_string(),
            device_name: config.device.name.clone(),
            ..Default::default()
        })));
    }

    if config.transports.enable_lan {
        channels.push(Arc::new(LanChannel::new(LanChannelConfig {
            device_id: device_id.to_string(),
            device_name: config.device.name.clone(),
            idle_timeout: config.transports.idle_timeout(),
            ..Default::default()
        })));
    }

    if config.transports.enable_radio {
        channels.push(Arc::new(RadioChannel::new(RadioChannelConfig::default())));
    }

    channels
}

/// Merge every channel's event stream into a single receiver
async fn merge_events(channels: &[Arc<dyn Channel>]) -> mpsc::UnboundedReceiver<ChannelEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    for channel in channels {
        let mut events = channel.subscribe().await;
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
    }

    rx
}

/// Load the persistent device id, generating one on first run
fn device_id(config: &Config) -> Result<String> {
    if let Some(id) = config.load_device_id() {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    config.save_device_id(&id)?;
    Ok(id)
}

async fn run_receive(config: Config, device_id: String) -> Result<()> {
    let channels = build_channels(&config, &device_id);
    if channels.is_empty() {
        anyhow::bail!("no transports enabled in configuration");
    }

    let mut events = merge_events(&channels).await;
    for channel in &channels {
        match channel.start_advertising().await {
            Ok(()) => info!("{} transport listening", channel.kind()),
            // one dead transport must not take down the others
            Err(e) => warn!("{} transport unavailable: {}", channel.kind(), e.user_message()),
        }
    }

    let pointer: Arc<dyn PointerOutput> = match pointer::UinputPointer::new() {
        Ok(p) => Arc::new(p),
        Err(e) => {
            warn!("{}; falling back to trace output", e.user_message());
            Arc::new(pointer::TracePointer)
        }
    };

    let bounds = ScreenBounds::new(config.receiver.screen_width, config.receiver.screen_height);
    let start = (bounds.width / 2.0, bounds.height / 2.0);

    let policy: Arc<dyn MotionPolicy> = match config.receiver.policy {
        PolicyConfig::Direct => Arc::new(DirectApply::new(pointer, bounds, start)),
        PolicyConfig::Interpolate => {
            let interpolating = Arc::new(Interpolating::new(
                pointer,
                bounds,
                InterpolatingConfig {
                    alpha: config.receiver.alpha,
                    epsilon: config.receiver.epsilon,
                    tick_hz: config.receiver.tick_hz,
                },
                start,
            ));
            interpolating.spawn_ticker();
            interpolating
        }
    };

    let registry = DiscoveryRegistry::new();
    let arbitrator = ReceiverArbitrator::new();
    info!("Receiver ready ({:?} policy)", config.receiver.policy);

    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else { break };
                registry.apply(&event).await;
                if let Some(report) = arbitrator.handle(&event) {
                    if let Err(e) = policy.apply(&report) {
                        warn!("Failed to apply motion: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    for channel in &channels {
        let _ = channel.disconnect().await;
    }
    Ok(())
}

async fn run_peers(config: Config, device_id: String, wait: u64) -> Result<()> {
    let channels = build_channels(&config, &device_id);
    let mut events = merge_events(&channels).await;

    for channel in &channels {
        if let Err(e) = channel.start_discovery().await {
            warn!("{} discovery unavailable: {}", channel.kind(), e.user_message());
        }
    }

    let registry = DiscoveryRegistry::new();
    let deadline = tokio::time::sleep(Duration::from_secs(wait));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else { break };
                registry.apply(&event).await;
            }
            _ = &mut deadline => break,
        }
    }

    let peers = registry.snapshot().await;
    if peers.is_empty() {
        println!("No receivers found.");
    } else {
        for peer in peers {
            println!("{}  {}  {}", peer.id(), peer.display_name, peer.address);
        }
    }
    Ok(())
}

async fn run_send(
    config: Config,
    device_id: String,
    target: String,
    dx: i16,
    dy: i16,
    count: u32,
    interval_ms: u64,
) -> Result<()> {
    let channels = build_channels(&config, &device_id);
    let mut events = merge_events(&channels).await;

    for channel in &channels {
        if let Err(e) = channel.start_discovery().await {
            warn!("{} discovery unavailable: {}", channel.kind(), e.user_message());
        }
    }

    // browse until the target shows up
    let registry = DiscoveryRegistry::new();
    info!("Waiting for {} to appear...", target);
    let peer = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let Some(event) = events.recv().await else {
                anyhow::bail!("event stream ended before target appeared");
            };
            registry.apply(&event).await;
            if let Some(peer) = registry.get(&target).await {
                return Ok(peer);
            }
        }
    })
    .await
    .context("Target did not appear within 30s")??;

    let arbitrator = SenderArbitrator::new(channels);
    arbitrator
        .connect_to(&peer)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e.user_message()))?;
    info!("Connected to {}; streaming {} reports", peer.display_name, count);

    let report = MotionReport::new(ButtonFlags::default(), dx, dy, 0);
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    for _ in 0..count {
        ticker.tick().await;
        arbitrator.send(&report).await;
    }

    arbitrator.disconnect_all().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli).context("Failed to initialize logging")?;

    info!("Starting AeroPoint daemon...");
    let config = Config::load().context("Failed to load configuration")?;
    let device_id = device_id(&config)?;
    info!("Device name: {}", config.device.name);

    match cli.command.unwrap_or(Command::Receive) {
        Command::Receive => run_receive(config, device_id).await,
        Command::Peers { wait } => run_peers(config, device_id, wait).await,
        Command::Send {
            target,
            dx,
            dy,
            count,
            interval_ms,
        } => run_send(config, device_id, target, dx, dy, count, interval_ms).await,
    }
}
