//! Surge Swarm - Deterministic swarm test harness
//!
//! Instantiates a multi-node swarm inside a simulated network, drives it
//! forward one virtual second at a time and reports whether the node under
//! test made the expected progress. Links are shaped per host by a DSL-like
//! topology in which the last byte of an address decides its speed.
//!
//! Node 0 is the node under test. Every other node is scaffolding that
//! either seeds to it or downloads from it, depending on the [`SwarmRole`].

pub mod config;
pub mod error;
pub mod hooks;
pub mod nodes;
pub mod rate;
pub mod relay;
pub mod settings;
mod shutdown;
pub mod status;
pub mod swarm;
mod ticker;
pub mod topology;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{SwarmConfig, SwarmRole};
pub use error::{Result, SwarmError};
pub use hooks::SwarmHooks;
pub use nodes::{node_address, save_path, scaffold_filter};
pub use rate::transfer_rate;
pub use settings::{default_settings, enable_enc, utp_only};
pub use status::{add_extra_peers, completed_pieces, get_status, has_metadata, is_seed};
pub use swarm::{Swarm, SwarmReport, default_add_torrent_params, setup_swarm};
pub use ticker::TICK_INTERVAL;
pub use topology::DslConfig;
