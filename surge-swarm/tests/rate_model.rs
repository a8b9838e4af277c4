//! Properties of the address-derived link model.

use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use proptest::prelude::*;
use surge_sim::RoutingPolicy;
use surge_swarm::{DslConfig, transfer_rate};

fn v4(bytes: [u8; 4]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(bytes))
}

proptest! {
    #[test]
    fn rate_is_strictly_monotonic_in_last_byte(
        prefix_a in any::<[u8; 3]>(),
        prefix_b in any::<[u8; 3]>(),
        a in any::<u8>(),
        b in any::<u8>(),
    ) {
        prop_assume!(a < b);
        let low = v4([prefix_a[0], prefix_a[1], prefix_a[2], a]);
        let high = v4([prefix_b[0], prefix_b[1], prefix_b[2], b]);
        prop_assert!(transfer_rate(low) < transfer_rate(high));
        prop_assert_eq!(transfer_rate(low), (u32::from(a) + 4) * 5);
    }

    #[test]
    fn routes_reuse_cached_queues(octets in any::<[u8; 4]>(), repeats in 2usize..6) {
        let mut dsl = DslConfig::new();
        let address = v4(octets);

        let incoming = dsl.incoming_route(address);
        let outgoing = dsl.outgoing_route(address);
        for _ in 0..repeats {
            prop_assert!(Rc::ptr_eq(&dsl.incoming_route(address).hops()[0], &incoming.hops()[0]));
            prop_assert!(Rc::ptr_eq(&dsl.outgoing_route(address).hops()[0], &outgoing.hops()[0]));
        }
        prop_assert_eq!(dsl.num_queues(), 2);
        prop_assert_eq!(incoming.hops()[0].rate(), u64::from(transfer_rate(address)) * 1000);
    }
}
