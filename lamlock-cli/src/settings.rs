use std::net::IpAddr;
use std::time::Duration;

use lamlock_core::engine::EngineConfig;
use lamlock_core::error::ConfigError;
use lamlock_core::node::NodeConfig;
use lamlock_core::transport_tcp::endpoint_addr;
use lamlock_core::types::PeerId;

use crate::Cli;

// ─── Defaults ───────────────────────────────────────────────────────────────

/// Per-identity stagger of the first request
const START_DELAY_STEP_MS: u64 = 3000;

// ─── Settings ───────────────────────────────────────────────────────────────

/// Everything one peer needs, validated
#[derive(Debug, Clone)]
pub struct Settings {
    pub engine: EngineConfig,
    pub node: NodeConfig,
    pub host: IpAddr,
    pub base_port: u16,
    pub rounds: u32,
    pub start_delay: Duration,
    pub interval: Duration,
    pub seed: u64,
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let engine = EngineConfig::new(cli.id, cli.peers, cli.role.into())?
            .with_capacity(cli.capacity)?;
        validate_ports(cli.host, cli.base_port, cli.peers)?;

        let node = NodeConfig {
            request_timeout: Duration::from_millis(cli.request_timeout_ms),
            max_retries: cli.max_retries,
            hold: Duration::from_millis(cli.hold_ms),
            ..NodeConfig::default()
        };
        let start_delay_ms = cli
            .start_delay_ms
            .unwrap_or_else(|| START_DELAY_STEP_MS.saturating_mul(u64::from(cli.id)));

        Ok(Self {
            engine,
            node,
            host: cli.host,
            base_port: cli.base_port,
            rounds: cli.rounds,
            start_delay: Duration::from_millis(start_delay_ms),
            interval: Duration::from_millis(cli.interval_ms),
            seed: cli.seed.unwrap_or(u64::from(cli.id)),
        })
    }
}

// ─── Validation Helpers ─────────────────────────────────────────────────────

/// Every endpoint of the group must be addressable, not just our own
fn validate_ports(host: IpAddr, base_port: u16, peers: u32) -> Result<(), ConfigError> {
    endpoint_addr(host, base_port, PeerId::new(peers)).map(|_| ())
}
