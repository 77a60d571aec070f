//! Management address allocation.

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;

/// Hands out addresses from a prefix, numerically smallest first. The
/// network and broadcast addresses are never assignable. Known addresses
/// can be taken out of the pool with [`IpAllocator::reserve`] before any
/// allocation happens; given the same reservation sequence, allocations are
/// stable across runs.
#[derive(Debug)]
pub(crate) struct IpAllocator {
    free: BTreeSet<IpAddr>,
}

impl IpAllocator {
    pub(crate) fn new(prefix: IpNet) -> Self {
        Self {
            free: prefix.hosts().collect(),
        }
    }

    /// Removes ip from the assignable set, returning whether it was present.
    pub(crate) fn reserve(&mut self, ip: IpAddr) -> bool {
        self.free.remove(&ip)
    }

    /// Removes and returns the smallest remaining address, or None when the
    /// range is exhausted.
    pub(crate) fn allocate(&mut self) -> Option<IpAddr> {
        self.free.pop_first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_net_2() -> IpNet {
        "198.51.100.0/29".parse().unwrap()
    }

    #[test]
    fn allocate_excludes_network_and_broadcast() {
        let mut a = IpAllocator::new(test_net_2());
        let mut want = Ipv4Addr::new(198, 51, 100, 1);
        for i in 0..6 {
            let got = a
                .allocate()
                .unwrap_or_else(|| panic!("got {} allocations, want 6", i));
            assert_eq!(got, IpAddr::V4(want));
            want = Ipv4Addr::from(u32::from(want) + 1);
        }
        assert_eq!(a.allocate(), None, "allocation despite exhausted range");
    }

    #[test]
    fn reserve_removes_from_pool() {
        let mut a = IpAllocator::new(test_net_2());
        assert!(a.reserve("198.51.100.1".parse().unwrap()));
        let mut want = Ipv4Addr::new(198, 51, 100, 2);
        for i in 0..5 {
            let got = a
                .allocate()
                .unwrap_or_else(|| panic!("got {} allocations, want 5", i));
            assert_eq!(got, IpAddr::V4(want));
            want = Ipv4Addr::from(u32::from(want) + 1);
        }
        assert_eq!(a.allocate(), None, "allocation despite exhausted range");
    }

    #[test]
    fn reserve_reports_missing() {
        let mut a = IpAllocator::new(test_net_2());
        assert!(!a.reserve("192.0.2.1".parse().unwrap()));
        assert!(a.reserve("198.51.100.3".parse().unwrap()));
        assert!(!a.reserve("198.51.100.3".parse().unwrap()));
    }
}
