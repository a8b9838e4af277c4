//! DSL-like network topology.
//!
//! Every simulated host sits behind its own modem: one queue for traffic
//! arriving at the host and one for traffic leaving it. Queues are created
//! the first time an address is routed and shared by every later route, so
//! all traffic to or from a host contends for the same link.

use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use surge_sim::{Queue, Route, RoutingPolicy};

use crate::rate::transfer_rate;

/// Buffer capacity of every modem queue, in bytes
pub const MODEM_BUFFER: u64 = 200_000;

/// Routing policy giving each address a rate-limited modem per direction.
#[derive(Debug, Default)]
pub struct DslConfig {
    incoming: HashMap<IpAddr, Rc<Queue>>,
    outgoing: HashMap<IpAddr, Rc<Queue>>,
}

impl DslConfig {
    /// Creates a topology with no modems yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of modem queues created so far, both directions.
    pub fn num_queues(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }

    fn modem(queues: &mut HashMap<IpAddr, Rc<Queue>>, address: IpAddr, label: &str) -> Route {
        let queue = queues.entry(address).or_insert_with(|| {
            let rate = transfer_rate(address);
            tracing::debug!(
                "Creating {} queue for {}: {} B/s, {} ms",
                label,
                address,
                rate * 1000,
                rate / 2
            );
            Rc::new(Queue::new(
                u64::from(rate) * 1000,
                Duration::from_millis(u64::from(rate / 2)),
                MODEM_BUFFER,
                label,
            ))
        });
        Route::new().append(Rc::clone(queue))
    }
}

impl RoutingPolicy for DslConfig {
    fn incoming_route(&mut self, address: IpAddr) -> Route {
        Self::modem(&mut self.incoming, address, "DSL modem in")
    }

    fn outgoing_route(&mut self, address: IpAddr) -> Route {
        Self::modem(&mut self.outgoing, address, "DSL modem out")
    }
}
