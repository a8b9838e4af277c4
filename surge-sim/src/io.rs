//! Address-bound I/O contexts and datagram endpoints.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::simulation::{Simulation, SimulationError, SimulationInner};
use crate::SimTime;

/// Datagram delivered to a bound endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sending endpoint
    pub from: SocketAddr,
    /// Receiving endpoint
    pub to: SocketAddr,
    /// Opaque payload
    pub payload: Bytes,
}

/// Execution context bound to one simulated host address.
///
/// Work posted here runs on the simulation's event loop. Tasks posted to
/// the same context at the same virtual time run in the order they were
/// posted.
#[derive(Clone)]
pub struct IoContext {
    sim: Simulation,
    address: IpAddr,
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl IoContext {
    /// Creates a context for the host at `address`.
    pub fn new(sim: &Simulation, address: IpAddr) -> Self {
        Self {
            sim: sim.clone(),
            address,
        }
    }

    /// Host address this context is bound to.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Simulation this context runs on.
    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    /// Current virtual time.
    pub fn now(&self) -> SimTime {
        self.sim.now()
    }

    /// Queues `task` to run at the current virtual time.
    ///
    /// Never runs `task` inline, so it is safe to call from code that holds
    /// state the task will need.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.sim.schedule_at(self.sim.now(), Box::new(task));
    }

    /// Binds `handler` to receive datagrams sent to this host on `port`.
    ///
    /// The endpoint stays bound until the returned [`Binding`] is dropped.
    ///
    /// # Errors
    ///
    /// - `SimulationError::AddressInUse` - Another binding owns the endpoint
    pub fn bind(
        &self,
        port: u16,
        handler: impl Fn(Datagram) + 'static,
    ) -> Result<Binding, SimulationError> {
        let endpoint = SocketAddr::new(self.address, port);
        let mut bindings = self.sim.inner.bindings.borrow_mut();
        if bindings.contains_key(&endpoint) {
            return Err(SimulationError::AddressInUse { endpoint });
        }
        bindings.insert(endpoint, Rc::new(handler));
        tracing::trace!("Bound endpoint {}", endpoint);

        Ok(Binding {
            sim: Rc::downgrade(&self.sim.inner),
            endpoint,
        })
    }

    /// Sends `payload` from `from_port` on this host to `to`.
    ///
    /// Delivery is asynchronous and shaped by the simulation's routing
    /// policy. Datagrams to unbound endpoints or through full queues are
    /// silently dropped.
    pub fn send_to(&self, from_port: u16, to: SocketAddr, payload: Bytes) {
        let from = SocketAddr::new(self.address, from_port);
        self.sim.deliver(from, to, payload);
    }
}

/// Registration of a datagram handler; unbinds on drop.
pub struct Binding {
    sim: Weak<SimulationInner>,
    endpoint: SocketAddr,
}

impl Binding {
    /// Endpoint this binding receives on.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        if let Some(sim) = self.sim.upgrade() {
            sim.bindings.borrow_mut().remove(&self.endpoint);
            tracing::trace!("Unbound endpoint {}", self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::net::Ipv4Addr;

    use super::*;

    fn host(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(50, 0, 0, last))
    }

    #[test]
    fn test_post_runs_in_fifo_order() {
        let sim = Simulation::default();
        let io = IoContext::new(&sim, host(1));
        let log = Rc::new(RefCell::new(Vec::new()));

        for n in 0..4 {
            let log = Rc::clone(&log);
            io.post(move || log.borrow_mut().push(n));
        }
        assert!(log.borrow().is_empty(), "post must not run inline");

        sim.run().unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_datagram_delivery_between_hosts() {
        let sim = Simulation::default();
        let a = IoContext::new(&sim, host(1));
        let b = IoContext::new(&sim, host(2));
        let received = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&received);
        let _binding = b
            .bind(6881, move |datagram| sink.borrow_mut().push(datagram))
            .unwrap();

        a.send_to(6881, SocketAddr::new(host(2), 6881), Bytes::from_static(b"ping"));
        sim.run().unwrap();

        let received = received.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from, SocketAddr::new(host(1), 6881));
        assert_eq!(&received[0].payload[..], b"ping");
        assert_eq!(sim.network_stats().delivered, 1);
    }

    #[test]
    fn test_unbound_endpoint_is_undeliverable() {
        let sim = Simulation::default();
        let a = IoContext::new(&sim, host(1));

        a.send_to(6881, SocketAddr::new(host(9), 6881), Bytes::from_static(b"x"));
        sim.run().unwrap();

        assert_eq!(sim.network_stats().undeliverable, 1);
    }

    #[test]
    fn test_binding_drop_unbinds() {
        let sim = Simulation::default();
        let io = IoContext::new(&sim, host(1));

        let binding = io.bind(6881, |_| {}).unwrap();
        assert!(matches!(
            io.bind(6881, |_| {}),
            Err(SimulationError::AddressInUse { .. })
        ));

        drop(binding);
        assert!(io.bind(6881, |_| {}).is_ok());
    }
}
