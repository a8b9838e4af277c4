//! Event loop driving the simulation in virtual time.

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::clock::{SimTime, VirtualClock};
use crate::events::ScheduledTask;
use crate::io::Datagram;
use crate::routing::{DefaultRouting, RoutingPolicy};

/// Errors that can occur during simulation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    /// Simulation ran past its virtual-time limit
    #[error("Simulation time limit exceeded: {elapsed:?} after {executed} tasks")]
    TimeLimitExceeded {
        /// Virtual time reached when the limit tripped
        elapsed: Duration,
        /// Continuations that ran before the limit tripped
        executed: u64,
    },

    /// Event could not be scheduled properly
    #[error("Invalid event scheduling: {reason}")]
    InvalidEventScheduling {
        /// Reason why scheduling failed
        reason: String,
    },

    /// Pending wait was cancelled before it completed
    #[error("Operation aborted")]
    OperationAborted,

    /// Another handler is already bound to the endpoint
    #[error("Address already in use: {endpoint}")]
    AddressInUse {
        /// Endpoint that was requested
        endpoint: SocketAddr,
    },
}

/// Datagram counters for the whole simulated network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Datagrams handed to a bound endpoint
    pub delivered: u64,
    /// Datagrams dropped by a full queue along the route
    pub dropped: u64,
    /// Datagrams that arrived at an address nobody is bound to
    pub undeliverable: u64,
}

pub(crate) type DatagramHandler = Rc<dyn Fn(Datagram)>;

pub(crate) struct SimulationInner {
    clock: RefCell<VirtualClock>,
    queue: RefCell<BinaryHeap<ScheduledTask>>,
    next_task_id: Cell<u64>,
    time_limit: Cell<Option<Duration>>,
    routing: RefCell<Box<dyn RoutingPolicy>>,
    pub(crate) bindings: RefCell<HashMap<SocketAddr, DatagramHandler>>,
    stats: Cell<NetworkStats>,
}

/// Single-threaded discrete-event simulation.
///
/// Cheap to clone; every clone refers to the same event loop, clock and
/// network. All work runs on the thread calling [`Simulation::run`].
#[derive(Clone)]
pub struct Simulation {
    pub(crate) inner: Rc<SimulationInner>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(DefaultRouting)
    }
}

impl Simulation {
    /// Creates a simulation whose links are shaped by `routing`.
    pub fn new(routing: impl RoutingPolicy + 'static) -> Self {
        Self {
            inner: Rc::new(SimulationInner {
                clock: RefCell::new(VirtualClock::new()),
                queue: RefCell::new(BinaryHeap::new()),
                next_task_id: Cell::new(0),
                time_limit: Cell::new(None),
                routing: RefCell::new(Box::new(routing)),
                bindings: RefCell::new(HashMap::new()),
                stats: Cell::new(NetworkStats::default()),
            }),
        }
    }

    /// Stops [`Simulation::run`] once virtual time would pass `limit`.
    pub fn set_time_limit(&self, limit: Option<Duration>) {
        self.inner.time_limit.set(limit);
    }

    /// Returns current simulation time.
    pub fn now(&self) -> SimTime {
        self.inner.clock.borrow().now()
    }

    /// Returns elapsed simulation time.
    pub fn elapsed(&self) -> Duration {
        self.inner.clock.borrow().elapsed()
    }

    /// Number of continuations waiting to run.
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Returns datagram counters accumulated so far.
    pub fn network_stats(&self) -> NetworkStats {
        self.inner.stats.get()
    }

    /// Runs continuations in virtual-time order until no work remains.
    ///
    /// Returns the number of continuations executed.
    ///
    /// # Errors
    ///
    /// - `SimulationError::TimeLimitExceeded` - The next continuation is due
    ///   after the configured time limit. Remaining work is discarded.
    pub fn run(&self) -> Result<u64, SimulationError> {
        let mut executed = 0u64;

        loop {
            let next = self.inner.queue.borrow_mut().pop();
            let Some(task) = next else {
                break;
            };

            if let Some(limit) = self.inner.time_limit.get() {
                if task.deadline.as_duration() > limit {
                    // Dropping pending closures may schedule more work, so
                    // release the queue borrow before they are destroyed.
                    let abandoned = std::mem::take(&mut *self.inner.queue.borrow_mut());
                    drop(task);
                    drop(abandoned);
                    return Err(SimulationError::TimeLimitExceeded {
                        elapsed: self.elapsed(),
                        executed,
                    });
                }
            }

            self.inner.clock.borrow_mut().advance_to(task.deadline)?;
            (task.callback)();
            executed += 1;
        }

        tracing::debug!(
            "Simulation drained after {} tasks at t={}",
            executed,
            self.now()
        );
        Ok(executed)
    }

    /// Schedules `task` to run at `deadline`, or now if `deadline` has passed.
    pub(crate) fn schedule_at(&self, deadline: SimTime, task: Box<dyn FnOnce()>) {
        let deadline = deadline.max(self.now());
        let id = self.inner.next_task_id.get();
        self.inner.next_task_id.set(id + 1);
        self.inner
            .queue
            .borrow_mut()
            .push(ScheduledTask::new(id, deadline, task));
    }

    /// Routes a datagram through the network and schedules its delivery.
    pub(crate) fn deliver(&self, from: SocketAddr, to: SocketAddr, payload: Bytes) {
        let size = payload.len() as u64;
        let mut arrival = self.now();

        if from.ip() != to.ip() {
            let route = {
                let mut routing = self.inner.routing.borrow_mut();
                routing
                    .outgoing_route(from.ip())
                    .concat(routing.incoming_route(to.ip()))
            };

            for hop in route.hops() {
                match hop.admit(arrival, size) {
                    Some(departure) => arrival = departure,
                    None => {
                        tracing::trace!(
                            "Dropped {} byte datagram {} -> {} at queue '{}'",
                            size,
                            from,
                            to,
                            hop.label()
                        );
                        self.bump_stats(|stats| stats.dropped += 1);
                        return;
                    }
                }
            }
        }

        let sim = self.clone();
        self.schedule_at(
            arrival,
            Box::new(move || {
                let handler = sim.inner.bindings.borrow().get(&to).cloned();
                match handler {
                    Some(handler) => {
                        sim.bump_stats(|stats| stats.delivered += 1);
                        handler(Datagram { from, to, payload });
                    }
                    None => {
                        tracing::trace!("No endpoint bound at {}, dropping datagram", to);
                        sim.bump_stats(|stats| stats.undeliverable += 1);
                    }
                }
            }),
        );
    }

    fn bump_stats(&self, update: impl FnOnce(&mut NetworkStats)) {
        let mut stats = self.inner.stats.get();
        update(&mut stats);
        self.inner.stats.set(stats);
    }
}
