//! CLI command implementations

use std::cell::Cell;
use std::net::IpAddr;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, bail};
use clap::Subcommand;
use surge_sim::RoutingPolicy;
use surge_swarm::{
    DslConfig, SwarmConfig, SwarmHooks, SwarmReport, SwarmRole, completed_pieces, enable_enc,
    is_seed, transfer_rate, utp_only,
};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run one swarm and report whether node 0 made progress
    Run {
        /// Number of nodes, node 0 included
        #[arg(short, long, default_value = "3")]
        nodes: usize,
        /// Side of the transfer node 0 plays
        #[arg(short, long, value_enum, default_value_t = SwarmRole::Download)]
        role: SwarmRole,
        /// Give up after this many ticks
        #[arg(long, default_value = "200")]
        max_ticks: u32,
        /// Restrict node 0 to uTP
        #[arg(long)]
        utp_only: bool,
        /// Force encrypted connections on node 0
        #[arg(long)]
        encrypt: bool,
        /// Directory the swarm directories are created in
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Seed for peer id generation
        #[arg(long)]
        seed: Option<u64>,
        /// Print the report as JSON instead of node 0's alerts
        #[arg(long)]
        json: bool,
    },
    /// Show the modem parameters the DSL topology assigns to addresses
    Links {
        /// Host addresses
        #[arg(required = true)]
        addresses: Vec<IpAddr>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            nodes,
            role,
            max_ticks,
            utp_only,
            encrypt,
            dir,
            seed,
            json,
        } => {
            let options = RunOptions {
                nodes,
                role,
                max_ticks,
                utp_only,
                encrypt,
                dir,
                seed,
                json,
            };
            run_swarm(options)
        }
        Commands::Links { addresses } => show_links(&addresses),
    }
}

/// Options of the `run` command.
#[derive(Debug)]
pub struct RunOptions {
    pub nodes: usize,
    pub role: SwarmRole,
    pub max_ticks: u32,
    pub utp_only: bool,
    pub encrypt: bool,
    pub dir: Option<PathBuf>,
    pub seed: Option<u64>,
    pub json: bool,
}

/// Run a swarm and print its report
///
/// # Errors
/// - Building the swarm failed
/// - The run did not pass, or node 0 did not finish its side of the transfer
pub fn run_swarm(options: RunOptions) -> anyhow::Result<()> {
    let mut config = SwarmConfig::from_env();
    if let Some(dir) = options.dir.clone() {
        config.base_dir = dir;
    }
    if let Some(seed) = options.seed {
        config.seed = seed;
    }
    if options.json {
        config.print_alerts = false;
    }

    let progress = Rc::new(Progress::default());
    let hooks = build_hooks(&options, Rc::clone(&progress));

    tracing::info!("Running {:?}", options);
    let report = surge_swarm::Swarm::new(options.nodes, options.role)
        .config(config)
        .hooks(hooks)
        .run()
        .context("failed to run swarm")?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, progress.pieces.get());
    }

    if !report.passed() {
        bail!(
            "swarm {} failed at tick {}: {}",
            report.swarm_id,
            report.final_tick,
            failure_summary(&report)
        );
    }
    if options.role == SwarmRole::Download && !progress.seeding.get() {
        bail!(
            "node 0 did not finish downloading within {} ticks",
            options.max_ticks
        );
    }
    Ok(())
}

/// Node 0's progress as last seen by the terminate hook.
#[derive(Debug, Default)]
struct Progress {
    pieces: Cell<u32>,
    seeding: Cell<bool>,
}

fn build_hooks(options: &RunOptions, progress: Rc<Progress>) -> SwarmHooks {
    let (utp, encrypt, role, max_ticks) = (
        options.utp_only,
        options.encrypt,
        options.role,
        options.max_ticks,
    );

    SwarmHooks::new()
        .session_customize(move |pack| {
            if utp {
                utp_only(pack);
            }
            if encrypt {
                enable_enc(pack);
            }
        })
        .terminate(move |tick, session| {
            progress.pieces.set(completed_pieces(session));
            progress.seeding.set(is_seed(session));
            match role {
                SwarmRole::Download => progress.seeding.get() || tick >= max_ticks,
                SwarmRole::Upload => tick >= max_ticks,
            }
        })
}

fn failure_summary(report: &SwarmReport) -> String {
    if report.failures.is_empty() {
        "not terminated".to_string()
    } else {
        report.failures.join("; ")
    }
}

fn print_report(report: &SwarmReport, pieces: u32) {
    println!();
    println!("Swarm {} ({} nodes, node 0 {}s)", report.swarm_id, report.num_nodes, report.role);
    println!("{:-<50}", "");
    println!("Result: {}", if report.passed() { "passed" } else { "failed" });
    println!("Final tick: {}", report.final_tick);
    println!("Virtual time: {:.3}s", report.elapsed_ms as f64 / 1000.0);
    println!("Pieces on node 0: {pieces}");
    println!("Peers wired: {}", report.peers_wired);
    println!("Alerts forwarded: {}", report.alerts_forwarded);
    println!(
        "Sessions shut down: {}/{}",
        report.zombies_shut_down, report.num_nodes
    );
    println!("Tasks executed: {}", report.tasks_executed);
    for failure in &report.failures {
        println!("Failure: {failure}");
    }
}

/// Print modem rate and latency for each address
///
/// # Errors
/// Never fails; returns a result to match the other commands
pub fn show_links(addresses: &[IpAddr]) -> anyhow::Result<()> {
    let mut dsl = DslConfig::new();

    println!("{:<40} {:>10} {:>10}", "Address", "Rate", "Latency");
    println!("{:-<62}", "");
    for &address in addresses {
        let route = dsl.incoming_route(address);
        let latency = route
            .hops()
            .first()
            .map(|queue| queue.latency())
            .unwrap_or_default();
        println!(
            "{:<40} {:>6} kB/s {:>8}ms",
            address,
            transfer_rate(address),
            latency.as_millis()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(role: SwarmRole, dir: PathBuf) -> RunOptions {
        RunOptions {
            nodes: 2,
            role,
            max_ticks: 100,
            utp_only: false,
            encrypt: false,
            dir: Some(dir),
            seed: Some(7),
            json: true,
        }
    }

    #[test]
    fn test_download_run_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_swarm(options(SwarmRole::Download, dir.path().to_path_buf()));
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn test_download_run_out_of_ticks_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(SwarmRole::Download, dir.path().to_path_buf());
        options.max_ticks = 1;
        let error = run_swarm(options).unwrap_err();
        assert!(error.to_string().contains("did not finish"));
    }

    #[test]
    fn test_show_links() {
        let addresses = ["50.0.0.1".parse().unwrap(), "::1".parse().unwrap()];
        assert!(show_links(&addresses).is_ok());
    }
}
