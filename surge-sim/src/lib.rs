//! Surge Simulation Substrate - Virtual time and simulated networks.
//!
//! This crate provides the discrete-event machinery the swarm harness runs
//! on: a single-threaded event loop driven by a virtual clock, address-bound
//! I/O contexts, deadline timers, and a datagram network whose links are
//! shaped by rate-limiting queues chosen through a routing policy.
//!
//! Nothing here touches real sockets or the wall clock. Work that would
//! block in a real deployment registers a continuation with the loop and
//! returns; [`Simulation::run`] invokes continuations in virtual-time order
//! until no work remains.
//!
//! # Example
//!
//! ```rust
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//!
//! use surge_sim::{DeadlineTimer, IoContext, Simulation};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sim = Simulation::default();
//! let io = IoContext::new(&sim, IpAddr::V4(Ipv4Addr::new(50, 0, 0, 1)));
//!
//! let timer = DeadlineTimer::new(&io);
//! timer.expires_from_now(Duration::from_secs(1));
//! timer.async_wait(|result| assert!(result.is_ok()));
//!
//! sim.run()?;
//! assert_eq!(sim.now().as_duration(), Duration::from_secs(1));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]

mod clock;
mod events;
mod io;
mod queue;
mod routing;
mod simulation;
mod timer;

pub use clock::{SimTime, VirtualClock};
pub use io::{Binding, Datagram, IoContext};
pub use queue::{Queue, QueueStats, Route};
pub use routing::{DefaultRouting, RoutingPolicy};
pub use simulation::{NetworkStats, Simulation, SimulationError};
pub use timer::DeadlineTimer;
