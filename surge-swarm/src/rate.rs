//! Link quality derived from a host's address.
//!
//! The last byte of an address decides how fast and how far away a
//! simulated host is, which makes a swarm heterogeneous without per-test
//! configuration.

use std::net::IpAddr;

/// Transfer rate class of `address`: `(last_byte + 4) * 5`.
///
/// Strictly increasing in the address's last byte. Callers scale it into a
/// throughput and a correlated latency.
pub fn transfer_rate(address: IpAddr) -> u32 {
    let last_byte = match address {
        IpAddr::V4(v4) => v4.octets()[3],
        IpAddr::V6(v6) => v6.octets()[15],
    };
    (u32::from(last_byte) + 4) * 5
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_rate_uses_last_byte() {
        assert_eq!(transfer_rate(IpAddr::V4(Ipv4Addr::new(50, 0, 0, 1))), 25);
        assert_eq!(transfer_rate(IpAddr::V4(Ipv4Addr::new(10, 9, 8, 1))), 25);
        assert_eq!(transfer_rate(IpAddr::V4(Ipv4Addr::new(50, 0, 1, 0))), 20);
        assert_eq!(transfer_rate(IpAddr::V4(Ipv4Addr::BROADCAST)), 1295);
    }

    #[test]
    fn test_rate_for_ipv6() {
        assert_eq!(transfer_rate(IpAddr::V6(Ipv6Addr::LOCALHOST)), 25);
        assert_eq!(transfer_rate(IpAddr::V6(Ipv6Addr::UNSPECIFIED)), 20);
    }
}
