//! Destination addresses allowed to transit the firewall untouched.

use std::net::Ipv4Addr;

/// Small immutable set of passed destinations. Typically a handful of
/// addresses, so membership is a linear scan.
#[derive(Debug, Clone)]
pub struct Whitelist {
    ips: Vec<Ipv4Addr>,
}

impl Whitelist {
    pub fn new(ips: Vec<Ipv4Addr>) -> Self {
        Self { ips }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.ips.iter().any(|ip| *ip == addr)
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }
}
