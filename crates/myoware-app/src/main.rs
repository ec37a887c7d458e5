//! MyoWare Central
//!
//! Discovers MyoWare wireless shields, connects to them and aggregates or
//! forwards their EMG samples.
//!
//! # Usage
//!
//! ```bash
//! # Full pipeline against simulated shields
//! myoware run
//!
//! # Real shields, forwarding every sample to WebSocket clients
//! myoware run --device ble --mode up-to-host --bind 127.0.0.1:8080
//!
//! # Offline: host clock, built-in config, 3 simulated shields
//! myoware run --local-clock --no-remote-config --shields 3 --target 3
//!
//! # List shields in range
//! myoware scan --device ble --scan-secs 10
//! ```

#[cfg(feature = "server")]
mod server;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use myoware_core::types::{RemoteConfig, RunningMode};
use myoware_native::bridge::{LinkEvent, LinkLayer, RetryPolicy, ShieldRegistry, SimulatedLink};
use myoware_native::clock::{
    AnyTimeSource, HttpTimeSource, SystemTimeSource, DEFAULT_TIME_TIMEOUT, DEFAULT_TIME_URL,
};
use myoware_native::config::{
    AnyConfigSource, CoordinatorConfig, HttpConfigSource, StaticConfigSource, DEFAULT_CONFIG_HOST,
    DEFAULT_CONFIG_PATH, DEFAULT_CONFIG_PORT,
};
use myoware_native::coordinator::discover;
use myoware_native::streaming::{EventPublisher, TracingPublisher};
use myoware_native::{Coordinator, Summary};

/// Simulated shields send this many samples per notification
const SIM_BATCH: usize = 10;

/// MyoWare Central
#[derive(Parser, Debug)]
#[command(name = "myoware")]
#[command(author, version, about = "Central for MyoWare wireless EMG shields", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline: clock, config, scan, connect, process
    Run(RunArgs),

    /// Scan for shields and print what was found
    Scan {
        /// Device connection type: ble or simulate
        #[arg(short, long, default_value = "simulate")]
        device: String,

        /// Number of simulated shields
        #[arg(long, default_value = "8")]
        shields: usize,

        /// Scan window in seconds
        #[arg(long, default_value = "20")]
        scan_secs: u64,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Device connection type: ble or simulate
    #[arg(short, long, default_value = "simulate")]
    device: String,

    /// Number of simulated shields
    #[arg(long, default_value = "8")]
    shields: usize,

    /// Shields to connect (overrides the remote NeededClientNumbers)
    #[arg(long)]
    target: Option<usize>,

    /// Running mode: standalone or up-to-host (overrides the remote runningMode)
    #[arg(long)]
    mode: Option<String>,

    /// Scan window in seconds
    #[arg(long, default_value = "20")]
    scan_secs: u64,

    /// Give up connecting after this many passes over the discovered shields
    #[arg(long)]
    max_passes: Option<usize>,

    /// Use the host clock instead of the network time service
    #[arg(long)]
    local_clock: bool,

    /// Remote config host
    #[arg(long, default_value = DEFAULT_CONFIG_HOST)]
    config_url_host: String,

    /// Remote config port
    #[arg(long, default_value_t = DEFAULT_CONFIG_PORT)]
    config_url_port: u16,

    /// Remote config path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config_url_path: String,

    /// Skip the remote config fetch and use built-in defaults
    #[arg(long)]
    no_remote_config: bool,

    /// Serve forwarded samples over WebSocket on this address
    #[arg(long)]
    bind: Option<String>,

    /// Stop after this many seconds of processing
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("MyoWare Central v{}", env!("CARGO_PKG_VERSION"));

    let rt = Runtime::new()?;
    match cli.command {
        Commands::Run(args) => {
            let summary = rt.block_on(run(args))?;
            info!(
                "Finished: {} discovered, {} connected, {} cycles, {} forwarded",
                summary.registry_size,
                summary.live_links,
                summary.completed_cycles,
                summary.forwarded_events
            );
        }
        Commands::Scan {
            device,
            shields,
            scan_secs,
        } => rt.block_on(scan(&device, shields, Duration::from_secs(scan_secs)))?,
    }

    Ok(())
}

fn simulated(shields: usize) -> (SimulatedLink, mpsc::Receiver<LinkEvent>) {
    let interval = u64::from(myoware_core::PERIPHERAL_INTERVAL_MS) * SIM_BATCH as u64;
    SimulatedLink::builder()
        .emg_shields(shields)
        .emit_every(Duration::from_millis(interval), SIM_BATCH)
        .build()
}

/// Run the pipeline on the selected device
async fn run(args: RunArgs) -> anyhow::Result<Summary> {
    info!("Device mode: {}", args.device);

    match args.device.as_str() {
        "simulate" => {
            let (link, events) = simulated(args.shields);
            run_with(Arc::new(link), events, &args).await
        }
        "ble" => {
            #[cfg(feature = "ble")]
            {
                let (link, events) = myoware_native::bridge::BleLink::new().await?;
                run_with(Arc::new(link), events, &args).await
            }

            #[cfg(not(feature = "ble"))]
            {
                anyhow::bail!(
                    "BLE support not enabled. Rebuild with --features ble:\n\
                     cargo run -p myoware-app --features ble"
                );
            }
        }
        other => anyhow::bail!("Unknown device type: {other}"),
    }
}

async fn run_with<L: LinkLayer>(
    link: Arc<L>,
    events: mpsc::Receiver<LinkEvent>,
    args: &RunArgs,
) -> anyhow::Result<Summary> {
    let mode_override = args
        .mode
        .as_deref()
        .map(RunningMode::from_str)
        .transpose()?;

    let config = CoordinatorConfig {
        scan_window: Duration::from_secs(args.scan_secs),
        retry: RetryPolicy {
            max_passes: args.max_passes,
            ..RetryPolicy::default()
        },
        target_override: args.target,
        mode_override,
        run_for: args.duration_secs.map(Duration::from_secs),
        ..CoordinatorConfig::default()
    };

    let time_source = if args.local_clock {
        AnyTimeSource::System(SystemTimeSource)
    } else {
        AnyTimeSource::Http(HttpTimeSource::new(DEFAULT_TIME_URL, DEFAULT_TIME_TIMEOUT)?)
    };

    let config_source = if args.no_remote_config {
        AnyConfigSource::Static(StaticConfigSource(RemoteConfig::default()))
    } else {
        AnyConfigSource::Http(HttpConfigSource::new(
            &args.config_url_host,
            args.config_url_port,
            &args.config_url_path,
            config.config_fetch.request_timeout,
        )?)
    };

    let publisher = publisher(args.bind.as_deref()).await?;

    let summary = Coordinator::new(link, events, time_source, config_source, config)
        .with_publisher(publisher)
        .run()
        .await?;
    Ok(summary)
}

/// Publisher for host-forwarding mode
async fn publisher(bind: Option<&str>) -> anyhow::Result<Box<dyn EventPublisher>> {
    let Some(bind) = bind else {
        return Ok(Box::new(TracingPublisher));
    };

    #[cfg(feature = "server")]
    {
        use myoware_native::streaming::BroadcastPublisher;

        let listener = tokio::net::TcpListener::bind(bind).await?;
        let publisher = BroadcastPublisher::default();

        let served = publisher.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(listener, served).await {
                warn!("WebSocket server stopped: {}", e);
            }
        });

        Ok(Box::new(publisher))
    }

    #[cfg(not(feature = "server"))]
    {
        warn!("WebSocket server not enabled, ignoring --bind {}", bind);
        Ok(Box::new(TracingPublisher))
    }
}

/// Scan only and print the registry
async fn scan(device: &str, shields: usize, window: Duration) -> anyhow::Result<()> {
    info!("Scanning for MyoWare wireless shields ({} s)...", window.as_secs());

    let registry = ShieldRegistry::new();
    match device {
        "simulate" => {
            let (link, mut events) = simulated(shields);
            discover(&link, &mut events, &registry, window).await?;
        }
        "ble" => {
            #[cfg(feature = "ble")]
            {
                let (link, mut events) = myoware_native::bridge::BleLink::new().await?;
                discover(&link, &mut events, &registry, window).await?;
            }

            #[cfg(not(feature = "ble"))]
            {
                anyhow::bail!("BLE support not enabled. Rebuild with --features ble");
            }
        }
        other => anyhow::bail!("Unknown device type: {other}"),
    }

    if registry.is_empty() {
        info!("  (none found)");
    }
    for (index, shield) in registry.ids().iter().enumerate() {
        info!("  [{}] {}", index, shield);
    }
    Ok(())
}
