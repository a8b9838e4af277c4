//! Harness configuration.
//!
//! Tunables for a swarm run live here instead of being scattered through the
//! harness. Environment variables override the defaults at runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Which side of the transfer the node under test plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SwarmRole {
    /// Node 0 downloads, every other node seeds
    Download,
    /// Node 0 seeds, every other node downloads
    Upload,
}

impl std::fmt::Display for SwarmRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwarmRole::Download => write!(f, "download"),
            SwarmRole::Upload => write!(f, "upload"),
        }
    }
}

/// Tunable parameters of a swarm run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmConfig {
    /// Directory the `swarm-*` directories are created in
    pub base_dir: PathBuf,
    /// Seed for the generator handing out peer ids
    pub seed: u64,
    /// Port every node listens on
    pub listen_port: u16,
    /// Piece size of the synthesized torrent
    pub piece_size: u32,
    /// Piece count of the synthesized torrent
    pub num_pieces: u32,
    /// Ticks each downloading peer is given in upload runs before the run
    /// counts as stalled
    pub stall_ticks_per_peer: u32,
    /// Print node 0's alerts on stdout
    pub print_alerts: bool,
    /// Log alerts of scaffold nodes before discarding them
    pub trace_scaffold_alerts: bool,
    /// Virtual time after which the run is abandoned
    pub time_limit: Option<Duration>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            seed: 42,
            listen_port: surge_core::DEFAULT_LISTEN_PORT,
            piece_size: 0x4000, // 16 KiB
            num_pieces: 9,
            stall_ticks_per_peer: 70,
            print_alerts: true,
            trace_scaffold_alerts: false,
            time_limit: Some(Duration::from_secs(3600)),
        }
    }
}

impl SwarmConfig {
    /// Default configuration with environment overrides applied.
    ///
    /// Reads `SURGE_SWARM_DIR`, `SURGE_SWARM_SEED`, `SURGE_PRINT_ALERTS`,
    /// `SURGE_TRACE_SCAFFOLD` and `SURGE_TIME_LIMIT_SECS`. Unparseable values
    /// are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("SURGE_SWARM_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(seed) = parse_var(&lookup, "SURGE_SWARM_SEED") {
            self.seed = seed;
        }
        if let Some(print) = parse_flag(&lookup, "SURGE_PRINT_ALERTS") {
            self.print_alerts = print;
        }
        if let Some(trace) = parse_flag(&lookup, "SURGE_TRACE_SCAFFOLD") {
            self.trace_scaffold_alerts = trace;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SURGE_TIME_LIMIT_SECS") {
            // zero disables the limit
            self.time_limit = (secs > 0).then(|| Duration::from_secs(secs));
        }
        self
    }

    /// Configuration for tests: quiet, rooted at `base_dir`.
    pub fn for_tests(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            print_alerts: false,
            ..Self::default()
        }
    }

    /// Tick after which an upload run with `num_nodes` nodes counts as stalled.
    pub fn stall_tick(&self, num_nodes: usize) -> u32 {
        let peers = u32::try_from(num_nodes.saturating_sub(1)).unwrap_or(u32::MAX);
        self.stall_ticks_per_peer.saturating_mul(peers)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring {}: cannot parse {:?}", key, value);
            None
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let value = lookup(key)?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Ignoring {}: cannot parse {:?}", key, value);
            None
        }
    }
}
