//! Routing policies mapping host addresses to link queues.

use std::net::IpAddr;

use crate::Route;

/// Chooses the queues traffic passes through on its way in and out of a host.
///
/// A datagram from `a` to `b` traverses `outgoing_route(a)` followed by
/// `incoming_route(b)`. Implementations may create queues lazily and must
/// return routes through the same queue for repeated calls when traffic
/// should share a link.
pub trait RoutingPolicy {
    /// Queues traversed by traffic arriving at `address`.
    fn incoming_route(&mut self, address: IpAddr) -> Route;

    /// Queues traversed by traffic leaving `address`.
    fn outgoing_route(&mut self, address: IpAddr) -> Route;
}

/// Unshaped network: every route is empty and delivery is immediate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRouting;

impl RoutingPolicy for DefaultRouting {
    fn incoming_route(&mut self, _address: IpAddr) -> Route {
        Route::new()
    }

    fn outgoing_route(&mut self, _address: IpAddr) -> Route {
        Route::new()
    }
}
