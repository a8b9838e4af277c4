//! Swarm orchestration.
//!
//! A [`Swarm`] builds the nodes, starts the tick driver and runs the
//! simulation until it drains. Everything the scheduled continuations share
//! lives in one [`SwarmContext`] owned by the run; continuations only hold
//! weak references to it and look nodes up by index.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use surge_core::{AddTorrentParams, SessionProxy, SettingsPack};
use surge_sim::{DeadlineTimer, IoContext, SimTime, Simulation, SimulationError};

use crate::config::{SwarmConfig, SwarmRole};
use crate::error::Result;
use crate::hooks::SwarmHooks;
use crate::nodes::{self, Node};
use crate::settings::default_settings;
use crate::ticker;
use crate::topology::DslConfig;

static SWARM_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Hands out a process-wide unique swarm id.
pub fn next_swarm_id() -> u32 {
    SWARM_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Add-torrent parameters every node starts from: unpaused.
pub fn default_add_torrent_params() -> AddTorrentParams {
    AddTorrentParams {
        paused: false,
        ..AddTorrentParams::default()
    }
}

/// State shared by a run's continuations.
pub(crate) struct SwarmContext {
    pub(crate) swarm_id: u32,
    pub(crate) role: SwarmRole,
    pub(crate) num_nodes: usize,
    pub(crate) config: SwarmConfig,
    /// Virtual time the run started; alert offsets count from here
    pub(crate) start: SimTime,
    pub(crate) hooks: RefCell<SwarmHooks>,
    /// Indexed by node; `None` once a node is released
    pub(crate) nodes: RefCell<Vec<Option<Node>>>,
    pub(crate) zombies: RefCell<Vec<SessionProxy>>,
    pub(crate) timer: RefCell<Option<DeadlineTimer>>,
    pub(crate) tick: Cell<u32>,
    pub(crate) terminated: Cell<bool>,
    pub(crate) mesh_formed: Cell<bool>,
    pub(crate) stall_reported: Cell<bool>,
    pub(crate) failures: RefCell<Vec<String>>,
    pub(crate) peers_wired: Cell<usize>,
    pub(crate) alerts_forwarded: Cell<usize>,
    pub(crate) drains_skipped: Cell<usize>,
}

impl SwarmContext {
    pub(crate) fn new(
        swarm_id: u32,
        role: SwarmRole,
        num_nodes: usize,
        config: SwarmConfig,
        start: SimTime,
        hooks: SwarmHooks,
    ) -> Self {
        Self {
            swarm_id,
            role,
            num_nodes,
            config,
            start,
            hooks: RefCell::new(hooks),
            nodes: RefCell::new(Vec::with_capacity(num_nodes)),
            zombies: RefCell::new(Vec::new()),
            timer: RefCell::new(None),
            tick: Cell::new(0),
            terminated: Cell::new(false),
            mesh_formed: Cell::new(false),
            stall_reported: Cell::new(false),
            failures: RefCell::new(Vec::new()),
            peers_wired: Cell::new(0),
            alerts_forwarded: Cell::new(0),
            drains_skipped: Cell::new(0),
        }
    }

    pub(crate) fn record_failure(&self, failure: String) {
        self.failures.borrow_mut().push(failure);
    }

    fn report(&self, tasks_executed: u64, now: SimTime) -> SwarmReport {
        let zombies = self.zombies.borrow();
        SwarmReport {
            swarm_id: self.swarm_id,
            role: self.role,
            num_nodes: self.num_nodes,
            final_tick: self.tick.get(),
            terminated: self.terminated.get(),
            failures: self.failures.borrow().clone(),
            live_nodes: self.nodes.borrow().iter().flatten().count(),
            zombies: zombies.len(),
            zombies_shut_down: zombies.iter().filter(|z| z.is_shut_down()).count(),
            peers_wired: self.peers_wired.get(),
            alerts_forwarded: self.alerts_forwarded.get(),
            drains_skipped: self.drains_skipped.get(),
            tasks_executed,
            elapsed_ms: now.saturating_duration_since(self.start).as_millis() as u64,
        }
    }
}

/// Outcome of a swarm run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwarmReport {
    pub swarm_id: u32,
    pub role: SwarmRole,
    pub num_nodes: usize,
    /// Tick at which shutdown was decided, or the last tick reached
    pub final_tick: u32,
    /// Whether the run ended through the shutdown sequencer
    pub terminated: bool,
    pub failures: Vec<String>,
    /// Nodes never released; zero after a terminated run
    pub live_nodes: usize,
    pub zombies: usize,
    pub zombies_shut_down: usize,
    /// Connections node 0 was asked to open while forming the mesh
    pub peers_wired: usize,
    /// Node 0 alerts handed to the observer
    pub alerts_forwarded: usize,
    /// Alert drains that found their node already released
    pub drains_skipped: usize,
    pub tasks_executed: u64,
    /// Virtual milliseconds from start to drain
    pub elapsed_ms: u64,
}

impl SwarmReport {
    /// Terminated without recorded failures.
    pub fn passed(&self) -> bool {
        self.terminated && self.failures.is_empty()
    }
}

/// Builder for one swarm run.
///
/// ```no_run
/// use surge_swarm::{Swarm, SwarmHooks, SwarmRole, is_seed};
///
/// let report = Swarm::new(3, SwarmRole::Download)
///     .hooks(SwarmHooks::new().terminate(|_, session| is_seed(session)))
///     .run()
///     .unwrap();
/// assert!(report.passed());
/// ```
pub struct Swarm {
    num_nodes: usize,
    role: SwarmRole,
    simulation: Option<Simulation>,
    settings: SettingsPack,
    add_torrent: AddTorrentParams,
    hooks: SwarmHooks,
    config: SwarmConfig,
}

impl Swarm {
    /// A run of `num_nodes` nodes with built-in defaults and environment
    /// configuration.
    pub fn new(num_nodes: usize, role: SwarmRole) -> Self {
        Self {
            num_nodes,
            role,
            simulation: None,
            settings: default_settings(),
            add_torrent: default_add_torrent_params(),
            hooks: SwarmHooks::default(),
            config: SwarmConfig::from_env(),
        }
    }

    /// Runs on `sim` instead of a fresh simulation over a [`DslConfig`].
    pub fn simulation(mut self, sim: Simulation) -> Self {
        self.simulation = Some(sim);
        self
    }

    /// Settings every node starts from.
    pub fn settings(mut self, settings: SettingsPack) -> Self {
        self.settings = settings;
        self
    }

    /// Add-torrent parameters every node starts from.
    pub fn add_torrent(mut self, params: AddTorrentParams) -> Self {
        self.add_torrent = params;
        self
    }

    pub fn hooks(mut self, hooks: SwarmHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the swarm and runs the simulation until it drains.
    ///
    /// Stalls and an exceeded time limit are not errors; they are recorded
    /// as failures in the report.
    ///
    /// # Errors
    /// - `SwarmError::InvalidNodeCount` - Zero nodes requested
    /// - `SwarmError::AddressSpaceExhausted` - More nodes than addresses
    /// - `SwarmError::Torrent` - The configured torrent layout is invalid
    /// - `SwarmError::Simulation` - The event loop failed
    pub fn run(self) -> Result<SwarmReport> {
        let sim = self
            .simulation
            .unwrap_or_else(|| Simulation::new(DslConfig::new()));
        let swarm_id = nodes::claim_swarm_id(&self.config.base_dir, next_swarm_id);

        if let Some(limit) = self.config.time_limit {
            sim.set_time_limit(Some(sim.elapsed() + limit));
        }

        let ctx = Rc::new(SwarmContext::new(
            swarm_id,
            self.role,
            self.num_nodes,
            self.config,
            sim.now(),
            self.hooks,
        ));
        tracing::info!(
            "Starting swarm {}: {} nodes, node 0 {}s",
            swarm_id,
            self.num_nodes,
            self.role
        );

        nodes::build_nodes(&ctx, &sim, &self.settings, &self.add_torrent)?;

        let driver = IoContext::new(&sim, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        ticker::start(&ctx, &driver);

        let tasks_executed = match sim.run() {
            Ok(executed) => executed,
            Err(SimulationError::TimeLimitExceeded { elapsed, executed }) => {
                tracing::error!(
                    "Swarm {} hit the time limit after {:?} at tick {}",
                    swarm_id,
                    elapsed,
                    ctx.tick.get()
                );
                ctx.record_failure(format!("time limit exceeded after {elapsed:?}"));
                executed
            }
            Err(e) => return Err(e.into()),
        };

        let report = ctx.report(tasks_executed, sim.now());
        tracing::info!(
            "Swarm {} finished at tick {}: {}",
            swarm_id,
            report.final_tick,
            if report.passed() { "passed" } else { "failed" }
        );
        Ok(report)
    }
}

/// Runs a swarm with default network, settings and add-torrent parameters.
///
/// # Errors
/// See [`Swarm::run`].
pub fn setup_swarm(num_nodes: usize, role: SwarmRole, hooks: SwarmHooks) -> Result<SwarmReport> {
    Swarm::new(num_nodes, role).hooks(hooks).run()
}

#[cfg(test)]
mod tests {
    use surge_core::create_torrent;

    use super::*;
    use crate::status;

    fn context(num_nodes: usize, role: SwarmRole, dir: &std::path::Path) -> Rc<SwarmContext> {
        Rc::new(SwarmContext::new(
            next_swarm_id(),
            role,
            num_nodes,
            SwarmConfig::for_tests(dir),
            SimTime::ZERO,
            SwarmHooks::default(),
        ))
    }

    #[test]
    fn test_mesh_formed_once() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Simulation::new(DslConfig::new());
        let ctx = context(3, SwarmRole::Download, dir.path());
        nodes::build_nodes(&ctx, &sim, &default_settings(), &default_add_torrent_params()).unwrap();

        // a second add of the same torrent raises another add_torrent alert
        {
            let nodes = ctx.nodes.borrow();
            let primary = nodes[0].as_ref().unwrap();
            let info = create_torrent(None, nodes::TORRENT_NAME, 0x4000, 9, false).unwrap();
            primary
                .session
                .async_add_torrent(AddTorrentParams::new(Rc::new(info), dir.path()));
        }
        sim.run().unwrap();

        assert!(ctx.mesh_formed.get());
        assert_eq!(ctx.peers_wired.get(), 2);

        let nodes = ctx.nodes.borrow();
        let primary = &nodes[0].as_ref().unwrap().session;
        let peers = status::torrent(primary).unwrap().peer_info();
        let mut endpoints: Vec<_> = peers.iter().map(|p| p.endpoint.ip()).collect();
        endpoints.sort();
        assert_eq!(endpoints, [nodes::node_address(1), nodes::node_address(2)]);
        assert!(status::is_seed(primary));
    }

    #[test]
    fn test_drain_for_released_node_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Simulation::new(DslConfig::new());
        let ctx = context(3, SwarmRole::Download, dir.path());
        nodes::build_nodes(&ctx, &sim, &default_settings(), &default_add_torrent_params()).unwrap();

        let released = ctx.nodes.borrow_mut()[2].take().unwrap();
        let proxy = released.session.abort();
        sim.run().unwrap();

        assert!(proxy.is_shut_down());
        assert_eq!(ctx.drains_skipped.get(), 1);
        let nodes = ctx.nodes.borrow();
        assert!(status::is_seed(&nodes[0].as_ref().unwrap().session));
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Swarm::new(0, SwarmRole::Download)
            .config(SwarmConfig::for_tests(dir.path()))
            .run();
        assert!(matches!(
            result,
            Err(crate::SwarmError::InvalidNodeCount { num_nodes: 0 })
        ));
    }
}
