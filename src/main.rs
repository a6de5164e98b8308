//! panelbus CLI - bridge between a flight simulator export stream and
//! cockpit panel hardware.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::signal;

use panelbus::config::{init_logging, Config};
use panelbus::error::{Error, Result};
use panelbus::protocol::{DataListener, SyncListener};
use panelbus::receiver::UdpReceiver;
use panelbus::VERSION;

#[derive(Parser)]
#[command(name = "panelbus", version = VERSION, about = "Simulator export stream to panel bus bridge")]
struct Cli {
    /// Configuration file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable colored log output.
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive the export stream and print decoded data writes.
    Monitor(MonitorArgs),
    /// Send a command to the simulator.
    Send(SendArgs),
}

#[derive(Parser)]
struct MonitorArgs {
    /// Listen port, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Multicast group, overriding the configuration.
    #[arg(short, long)]
    group: Option<Ipv4Addr>,

    /// Receive unicast only; do not join a multicast group.
    #[arg(long, conflicts_with = "group")]
    unicast: bool,

    /// Only print writes at or above this address (decimal or 0x hex).
    #[arg(long, value_parser = parse_address)]
    from: Option<u16>,

    /// Only print writes at or below this address (decimal or 0x hex).
    #[arg(long, value_parser = parse_address)]
    to: Option<u16>,

    /// Also print frame sync events.
    #[arg(long)]
    syncs: bool,
}

fn parse_address(s: &str) -> std::result::Result<u16, std::num::ParseIntError> {
    s.strip_prefix("0x")
        .map_or_else(|| s.parse(), |hex| u16::from_str_radix(hex, 16))
}

#[derive(Parser)]
struct SendArgs {
    /// The command text, e.g. "UFC_1 1".
    command: String,

    /// How long to wait for the simulator to be heard from first.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    wait: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };
    config.logging.level = cli.log_level.clone();
    config.logging.color = !cli.no_color;
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Monitor(args) => run_monitor(args, config).await,
        Commands::Send(args) => run_send(args, config).await,
    }
}

struct PrintWrites {
    from: u16,
    to: u16,
}

impl DataListener for PrintWrites {
    fn data_written(&self, address: u16, value: u16) {
        if (self.from..=self.to).contains(&address) {
            println!("{address:#06x} <- {value:#06x}");
        }
    }
}

struct PrintSyncs {
    enabled: bool,
    frames: AtomicU64,
}

impl SyncListener for PrintSyncs {
    fn frame_sync(&self) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if self.enabled {
            println!("--- frame sync ({n}) ---");
        }
    }
}

async fn run_monitor(args: MonitorArgs, mut config: Config) -> Result<()> {
    if let Some(port) = args.port {
        config.receiver.port = port;
    }
    if let Some(group) = args.group {
        config.receiver.group = Some(group);
    }
    if args.unicast {
        config.receiver.group = None;
    }
    config.validate()?;

    let receiver = UdpReceiver::new(&config.receiver)?;
    receiver.add_data_listener(Arc::new(PrintWrites {
        from: args.from.unwrap_or(u16::MIN),
        to: args.to.unwrap_or(u16::MAX),
    }));
    receiver.add_sync_listener(Arc::new(PrintSyncs {
        enabled: args.syncs,
        frames: AtomicU64::new(0),
    }));

    println!(
        "Listening on port {} ({}), Ctrl-C to stop",
        config.receiver.port,
        config
            .receiver
            .group
            .map_or_else(|| "unicast".to_string(), |g| format!("group {g}")),
    );
    receiver.start();

    let _ = signal::ctrl_c().await;
    println!();
    receiver.stop();
    receiver.stopped().await;

    let stats = receiver.parser_stats();
    println!(
        "Received {} data writes over {} frames ({} resyncs)",
        stats.data_events, stats.frames, stats.resyncs
    );

    Ok(())
}

async fn run_send(args: SendArgs, config: Config) -> Result<()> {
    config.validate()?;

    // Commands go to the address the export stream comes from, so we have
    // to hear the simulator before we can talk to it.
    let receiver = UdpReceiver::new(&config.receiver)?;
    receiver.start();

    let deadline = Instant::now() + args.wait;
    while receiver.peer().is_none() {
        if Instant::now() >= deadline {
            receiver.stop();
            receiver.stopped().await;
            return Err(Error::Internal(format!(
                "No export stream heard within {}",
                humantime::format_duration(args.wait)
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let peer = receiver.peer();
    receiver.send_command_str(&format!("{}\n", args.command.trim_end()));
    println!(
        "Sent to {}:{}: {}",
        peer.map_or_else(|| "?".to_string(), |ip| ip.to_string()),
        config.receiver.command_port,
        args.command
    );

    receiver.stop();
    receiver.stopped().await;
    Ok(())
}
