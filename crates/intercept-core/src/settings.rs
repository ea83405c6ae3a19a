//! Runtime settings for the interception server.
//!
//! The embedding binary assembles a [`Settings`] from its CLI flags and
//! optional TOML config file; the server treats it as immutable after startup.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Stats / routing-sweep timer period.
pub const OUTPUT_INTERVAL: Duration = Duration::from_millis(30_000);

/// Combined-mode flush timer period.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Kernel queue backend, selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Legacy ip_queue netlink socket (`NETLINK_FIREWALL`).
    Ipq,
    /// libnetfilter_queue, one queue bound to `queue_num`.
    Nfqueue,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// IPv4 address the control server listens on.
    pub ip: Ipv4Addr,
    /// Control server TCP port.
    pub port: u16,
    /// Destination addresses whose packets transit the firewall untouched.
    pub passed_ips: Vec<Ipv4Addr>,
    /// Routing table capacity hint.
    pub hash_size: usize,
    /// Routing entry idle timeout in seconds.
    pub timeout: u64,
    pub backend: Backend,
    /// NFQUEUE queue number (nfqueue backend only).
    pub queue_num: u16,
    /// Single replay-client deployment: routing table bypassed, the one
    /// accepted control connection receives every fingerprint.
    pub single: bool,
    /// Coalesce upstream notifications and flush them on `CHECK_INTERVAL`.
    pub combined: bool,
    /// Run netlink verdicts and upstream forwarding on worker threads
    /// (ipq backend only).
    pub threaded: bool,
    /// Staging ring capacity in slots, rounded up to a power of two.
    pub pool_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            port: 36524,
            passed_ips: Vec::new(),
            hash_size: 65_536,
            timeout: 120,
            backend: Backend::Ipq,
            queue_num: 0,
            single: false,
            combined: false,
            threaded: false,
            pool_size: 1024,
        }
    }
}
