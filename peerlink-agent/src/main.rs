//! peerlink agent entry point.
//!
//! ```text
//! peerlink-agent pair offer                  Print a PIN and wait for a peer
//! peerlink-agent pair accept <PIN> --peer A  Pair with the peer offering PIN
//! peerlink-agent devices                     List paired devices
//! peerlink-agent serve [--device ROOM]       Share [vfs].root with a device
//! peerlink-agent ls <PATH>                   List a remote directory
//! peerlink-agent get <REMOTE> <LOCAL>        Download a remote file
//! peerlink-agent --config <path>             Load a custom config TOML
//! peerlink-agent --gen-config                Write default config to stdout
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use peerlink_agent::config::AgentConfig;
use peerlink_agent::service::{Agent, AgentResult, PeerSession};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "peerlink-agent", about = "Pair devices and share files between them")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "peerlink-agent.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pair with another device.
    #[command(subcommand)]
    Pair(PairCommand),
    /// List paired devices.
    Devices,
    /// Share the configured directory with a paired device.
    Serve {
        /// Room id of the device; optional with a single pairing.
        #[arg(long)]
        device: Option<String>,
    },
    /// List a directory on the peer.
    Ls {
        path: String,
        #[command(flatten)]
        target: Target,
    },
    /// Download a file from the peer.
    Get {
        remote: String,
        local: PathBuf,
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Subcommand, Debug)]
enum PairCommand {
    /// Listen and print a PIN for the other side to enter.
    Offer,
    /// Enter the PIN shown by the offering side.
    Accept {
        pin: String,
        /// Address of the offering side.
        #[arg(long)]
        peer: Option<SocketAddr>,
    },
}

/// Which peer and stream to browse.
#[derive(Args, Debug)]
struct Target {
    #[arg(long)]
    device: Option<String>,
    #[arg(long, default_value_t = 1)]
    stream: u32,
    #[arg(long)]
    peer: Option<SocketAddr>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> AgentResult<()> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", AgentConfig::default_toml()?);
        return Ok(());
    }
    let Some(command) = cli.command else {
        eprintln!("no command given; see --help");
        std::process::exit(2);
    };

    let config = AgentConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("peerlink-agent v{}", env!("CARGO_PKG_VERSION"));
    let agent = Agent::new(config)?;

    match command {
        Command::Pair(PairCommand::Offer) => {
            let session = agent.pair_offer()?;
            println!("PIN: {}", session.pin());
            let machine = session.machine().clone();
            tokio::select! {
                record = session.wait() => {
                    let record = record?;
                    println!("paired with {} (room {})", record.display_name(), record.room_id);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, abandoning pairing");
                    machine.dispose();
                }
            }
        }
        Command::Pair(PairCommand::Accept { pin, peer }) => {
            let peer = peer.unwrap_or(agent.config().network.peer);
            let record = agent.pair_accept(&pin, peer)?.wait().await?;
            println!("paired with {} (room {})", record.display_name(), record.room_id);
        }
        Command::Devices => {
            let devices = agent.registry().devices();
            if devices.is_empty() {
                println!("no paired devices");
            }
            for device in devices {
                println!("{}\t{}", device.room_id, device.display_name());
            }
        }
        Command::Serve { device } => {
            let shutdown = async {
                tokio::signal::ctrl_c().await.ok();
                info!("Ctrl-C received");
            };
            agent.serve(device.as_deref(), shutdown).await?;
        }
        Command::Ls { path, target } => {
            let session = connect(&agent, &target).await?;
            for entry in agent.list(&session, &path).await? {
                let kind = if entry.is_dir() { 'd' } else { '-' };
                println!("{kind} {:>12} {}", entry.size, entry.name);
            }
        }
        Command::Get {
            remote,
            local,
            target,
        } => {
            let session = connect(&agent, &target).await?;
            let copied = tokio::select! {
                copied = agent.download(&session, &remote, &local) => copied?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, download abandoned");
                    return Ok(());
                }
            };
            println!("{copied} bytes -> {}", local.display());
        }
    }

    Ok(())
}

async fn connect(agent: &Agent, target: &Target) -> AgentResult<PeerSession> {
    agent
        .connect(target.device.as_deref(), target.stream, target.peer)
        .await
}
