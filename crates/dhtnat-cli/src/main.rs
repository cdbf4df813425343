//! dhtnat CLI
//!
//! Runs a standalone puncher over UDP: serve as a rendezvous, hold a binding
//! from behind NAT, or punch toward a peer.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use dhtnat::{
    ChannelListener, ClientData, Contact, InboundHandler, NatPuncher, PunchOutcome, PuncherEvent,
    UdpDirectory,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{PunchProgress, format_rtt};

/// dhtnat - NAT traversal for DHT peers
#[derive(Parser)]
#[command(name = "dhtnat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a puncher until interrupted
    Run {
        /// Pursue a rendezvous even if directly reachable
        #[arg(long)]
        force_active: bool,

        /// Print stats at this interval (seconds, 0 disables)
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },

    /// Punch toward a peer and report the outcome
    Punch {
        /// Target as `ip:port` or `hex-id@ip:port`
        target: Contact,

        /// Application label for the session
        #[arg(short, long, default_value = "cli")]
        reason: String,

        /// Rendezvous to try first
        #[arg(long)]
        via: Option<Contact>,

        /// Seconds to wait for our own binding before punching
        #[arg(long, default_value_t = 0)]
        settle: u64,
    },

    /// Relay a JSON object to a peer through its rendezvous
    Message {
        /// Rendezvous the target is bound to
        rendezvous: Contact,

        /// Target peer
        target: Contact,

        /// JSON object to deliver
        payload: String,
    },

    /// Print the effective configuration
    Config {
        /// Write the defaults to the config path
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = if config_path.exists() {
        Config::load(&config_path)?
    } else if cli.config.is_some() {
        anyhow::bail!("Config file not found: {}", config_path.display());
    } else {
        Config::load_or_default(&config_path)?
    };
    if let Some(bind) = &cli.bind {
        config.node.listen_addr.clone_from(bind);
    }

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Run {
            force_active,
            stats_interval,
        } => run(&config, force_active, stats_interval).await,
        Commands::Punch {
            target,
            reason,
            via,
            settle,
        } => punch(&config, target, &reason, via, settle).await,
        Commands::Message {
            rendezvous,
            target,
            payload,
        } => message(&config, rendezvous, target, &payload).await,
        Commands::Config { init } => show_config(&config, &config_path, init),
    }
}

/// A puncher wired to a UDP socket
struct Node {
    directory: Arc<UdpDirectory>,
    puncher: Arc<NatPuncher>,
    // keeps the receiver's weak handler alive
    _handler: Arc<dyn InboundHandler>,
}

impl Node {
    async fn start(config: &Config) -> anyhow::Result<Self> {
        let directory =
            UdpDirectory::bind(config.parse_listen_addr()?, config.node_id()?).await?;
        for peer in config.rendezvous_contacts()? {
            directory.add_rendezvous(peer);
        }

        let puncher = NatPuncher::builder(directory.clone())
            .config(config.puncher.clone())
            .build()?;
        let handler: Arc<dyn InboundHandler> = puncher.clone();
        directory.spawn_receiver(Arc::downgrade(&handler));
        puncher.start()?;

        tracing::info!(local = %puncher.get_local_contact(), "Node started");
        Ok(Self {
            directory,
            puncher,
            _handler: handler,
        })
    }

    fn stop(&self) {
        self.puncher.destroy();
        self.directory.shutdown();
    }
}

async fn run(config: &Config, force_active: bool, stats_interval: u64) -> anyhow::Result<()> {
    let node = Node::start(config).await?;
    if force_active {
        node.puncher.force_active(true)?;
    }
    let (listener, mut events) = ChannelListener::new();
    node.puncher.add_listener(listener)?;

    println!("dhtnat {}", env!("CARGO_PKG_VERSION"));
    println!("Local: {}", node.puncher.get_local_contact());
    println!("Rendezvous candidates: {}", config.rendezvous.peers.len());
    println!("Press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = events.recv() => print_event(&event),
            _ = ticker.tick(), if stats_interval > 0 => {
                println!("{}", node.puncher.get_stats());
            }
        }
    }

    println!("\nShutting down...");
    node.stop();
    Ok(())
}

fn print_event(event: &PuncherEvent) {
    match event {
        PuncherEvent::BindingEstablished(rendezvous) => println!("Bound to {rendezvous}"),
        PuncherEvent::BindingLost(rendezvous) => println!("Lost binding to {rendezvous}"),
        PuncherEvent::ActiveChanged(active) => println!("Active: {active}"),
        PuncherEvent::OperationalChanged(operational) => println!("Operational: {operational}"),
        PuncherEvent::SessionSucceeded { target, addr } => {
            println!("Punched {target} at {addr}");
        }
        PuncherEvent::SessionFailed { target, reason } => {
            println!("Punch to {target} failed: {reason}");
        }
    }
}

async fn punch(
    config: &Config,
    target: Contact,
    reason: &str,
    via: Option<Contact>,
    settle: u64,
) -> anyhow::Result<()> {
    let node = Node::start(config).await?;
    if settle > 0 {
        tokio::time::sleep(Duration::from_secs(settle)).await;
    }

    let progress = PunchProgress::new(&target.to_string());
    let result = match node.puncher.punch(reason, &target, via, None).await {
        Ok(result) => result,
        Err(e) => {
            progress.abandon(&e.to_string());
            node.stop();
            return Err(e.into());
        }
    };
    progress.finish(&result);

    if let PunchOutcome::Succeeded { rtt, .. } = &result.outcome {
        println!("RTT: {}", format_rtt(*rtt));
    }
    let tried: Vec<String> = result
        .rendezvous_used
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("Rendezvous tried: {}", tried.join(", "));
    if result.via_secondary {
        println!("Resolved by secondary puncher");
    }
    if let Some(data) = &result.client_data {
        println!("Client data: {}", serde_json::to_string(data)?);
    }

    node.stop();
    Ok(())
}

async fn message(
    config: &Config,
    rendezvous: Contact,
    target: Contact,
    payload: &str,
) -> anyhow::Result<()> {
    let payload: ClientData = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("Payload must be a JSON object: {e}"))?;

    let node = Node::start(config).await?;
    node.directory.add_rendezvous(rendezvous.clone());
    let reply = node.puncher.send_message(&rendezvous, &target, payload).await;
    node.stop();

    println!("{}", serde_json::to_string_pretty(&reply?)?);
    Ok(())
}

fn show_config(config: &Config, path: &Path, init: bool) -> anyhow::Result<()> {
    if init {
        config.save(path)?;
        println!("Wrote {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
