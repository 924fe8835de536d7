mod peer;
mod settings;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use lamlock_core::types::Role;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    ReadOnly,
    ReadWrite,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::ReadOnly => Role::ReadOnly,
            RoleArg::ReadWrite => Role::ReadWrite,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "lamlock",
    about = "lamlock: Ricart-Agrawala mutual exclusion over TCP pub/sub",
    version
)]
pub struct Cli {
    /// Identity of this peer, in [1, peers]
    #[arg(env = "LAMLOCK_ID")]
    id: u32,

    /// Size of the group
    #[arg(long, default_value = "3", env = "LAMLOCK_PEERS")]
    peers: u32,

    /// Host every peer binds and connects on
    #[arg(long, default_value = "127.0.0.1", env = "LAMLOCK_HOST")]
    host: std::net::IpAddr,

    /// Peer N publishes on base_port + N
    #[arg(long, default_value = "3000", env = "LAMLOCK_BASE_PORT")]
    base_port: u16,

    /// What this peer does inside the critical section
    #[arg(long, value_enum, default_value = "read-only", env = "LAMLOCK_ROLE")]
    role: RoleArg,

    /// Slots in the shared resource
    #[arg(long, default_value = "8")]
    capacity: usize,

    /// Critical-section rounds to run; 0 keeps the peer passive
    #[arg(long, default_value = "1", env = "LAMLOCK_ROUNDS")]
    rounds: u32,

    /// Wait before the first request [default: 3000 × id]
    #[arg(long)]
    start_delay_ms: Option<u64>,

    /// Pause between rounds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// How long the critical section is held
    #[arg(long, default_value = "0")]
    hold_ms: u64,

    /// Re-issue a request that has not been granted within this time
    #[arg(long, default_value = "5000")]
    request_timeout_ms: u64,

    /// Re-issues before a request is abandoned
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Seed for slot and value choice [default: the peer identity]
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let settings = match settings::Settings::from_cli(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("lamlock: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = peer::run(settings).await {
        tracing::error!("❌ {:#}", e);
        std::process::exit(1);
    }
}
