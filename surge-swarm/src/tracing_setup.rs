//! Log output for swarm runs.
//!
//! The console gets events at the level the user asked for, or whatever
//! `SURGE_LOG` selects. Every event of the run also lands in a trace file,
//! so a failed swarm can be read back tick by tick.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Environment variable overriding the console filter
pub const LOG_ENV: &str = "SURGE_LOG";

/// File the full trace is written to, replaced on every run
pub const TRACE_FILE: &str = "surge-last-run.log";

/// Errors from installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("cannot create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot open trace file {path}: {source}")]
    TraceFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("a global subscriber is already installed")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Installs the console and trace-file subscriber.
///
/// The trace file goes to `logs_dir`, or `./logs` when none is given, and
/// its path is returned.
///
/// # Errors
/// - `TracingSetupError::LogDir` - The log directory cannot be created
/// - `TracingSetupError::TraceFile` - The trace file cannot be opened
/// - `TracingSetupError::AlreadyInstalled` - Tracing was set up before
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingSetupError> {
    let dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    fs::create_dir_all(dir).map_err(|source| TracingSetupError::LogDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let trace_path = dir.join(TRACE_FILE);
    let trace_file = File::create(&trace_path).map_err(|source| TracingSetupError::TraceFile {
        path: trace_path.clone(),
        source,
    })?;

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter(console_level));

    let trace = fmt::layer()
        .without_time()
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(trace_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console)
        .with(trace)
        .try_init()?;

    tracing::debug!("Full trace in {}", trace_path.display());
    Ok(trace_path)
}

fn console_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Console verbosity selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    /// Matching `tracing` level.
    ///
    /// ```
    /// use surge_swarm::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Info.as_tracing_level(), tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_tracing_level().as_str().to_lowercase())
    }
}
