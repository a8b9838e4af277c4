//! Address range filter applied to peer connections.

use std::net::IpAddr;

/// Range rules mapping addresses to access flags.
///
/// Rules are applied in insertion order, so a later rule overrides an
/// earlier one wherever their ranges overlap. Addresses no rule covers get
/// flags `0` (allowed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpFilter {
    rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    first: IpAddr,
    last: IpAddr,
    flags: u32,
}

impl IpFilter {
    /// Flag marking an address as blocked
    pub const BLOCKED: u32 = 1;

    /// Creates a filter allowing everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `flags` for every address in `first..=last`.
    ///
    /// Ranges whose ends belong to different address families, or whose
    /// ends are reversed, are ignored.
    pub fn add_rule(&mut self, first: IpAddr, last: IpAddr, flags: u32) {
        if first.is_ipv4() != last.is_ipv4() || first > last {
            tracing::warn!("Ignoring invalid ip filter range {}-{}", first, last);
            return;
        }
        self.rules.push(Rule { first, last, flags });
    }

    /// Flags applying to `address`.
    pub fn access(&self, address: IpAddr) -> u32 {
        self.rules
            .iter()
            .rev()
            .find(|rule| {
                rule.first.is_ipv4() == address.is_ipv4()
                    && rule.first <= address
                    && address <= rule.last
            })
            .map_or(0, |rule| rule.flags)
    }

    /// Whether `address` is blocked.
    pub fn is_blocked(&self, address: IpAddr) -> bool {
        self.access(address) & Self::BLOCKED != 0
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = IpFilter::new();
        assert_eq!(filter.access(v4(1, 2, 3, 4)), 0);
        assert!(!filter.is_blocked(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_later_rules_win() {
        let mut filter = IpFilter::new();
        filter.add_rule(v4(0, 0, 0, 0), v4(255, 255, 255, 255), IpFilter::BLOCKED);
        filter.add_rule(v4(50, 0, 0, 1), v4(50, 0, 0, 1), 0);

        assert!(!filter.is_blocked(v4(50, 0, 0, 1)));
        assert!(filter.is_blocked(v4(50, 0, 0, 2)));
        assert!(filter.is_blocked(v4(60, 0, 0, 1)));
        // IPv4 rules say nothing about IPv6
        assert!(!filter.is_blocked(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_invalid_ranges_ignored() {
        let mut filter = IpFilter::new();
        filter.add_rule(v4(10, 0, 0, 9), v4(10, 0, 0, 1), IpFilter::BLOCKED);
        filter.add_rule(
            v4(0, 0, 0, 0),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpFilter::BLOCKED,
        );
        assert!(!filter.is_blocked(v4(10, 0, 0, 5)));
        assert_eq!(filter, IpFilter::new());
    }
}
