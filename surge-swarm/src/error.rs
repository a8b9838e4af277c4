//! Error types for the swarm harness.

use surge_core::TorrentError;
use surge_sim::SimulationError;
use thiserror::Error;

/// Errors that keep a swarm run from starting or finishing.
///
/// Protocol failures inside a run are not errors; they surface as alerts
/// and as failures in the [`crate::SwarmReport`].
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("A swarm needs at least one node, got {num_nodes}")]
    InvalidNodeCount { num_nodes: usize },

    #[error("Too many nodes for the 50.0.x.y address plan: {num_nodes}")]
    AddressSpaceExhausted { num_nodes: usize },

    #[error("Torrent synthesis failed: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Simulation failed: {0}")]
    Simulation(#[from] SimulationError),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, SwarmError>;
