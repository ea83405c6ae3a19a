//! CLI definitions for interceptd.

use clap::{Parser, ValueEnum};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "interceptd",
    version,
    about = "TCP replay interception server\n\nSuppresses replayed response traffic at the firewall queue and returns each suppressed packet's IP header to the replay driver that owns the flow.",
    long_about = None
)]
pub struct Cli {
    /// Path to an optional interceptd.toml config file; flags override it
    #[clap(long, short)]
    pub config: Option<PathBuf>,

    /// IPv4 address the control server listens on
    #[clap(long)]
    pub ip: Option<Ipv4Addr>,

    /// Control server TCP port
    #[clap(long, short)]
    pub port: Option<u16>,

    /// Comma-separated destination addresses allowed through the firewall
    #[clap(long = "passed-ips", short = 'x', value_delimiter = ',')]
    pub passed_ips: Vec<Ipv4Addr>,

    /// Routing table capacity hint
    #[clap(long)]
    pub hash_size: Option<usize>,

    /// Routing entry idle timeout in seconds
    #[clap(long, short)]
    pub timeout: Option<u64>,

    /// Kernel queue backend
    #[clap(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// NFQUEUE queue number (nfqueue backend only)
    #[clap(long)]
    pub queue_num: Option<u16>,

    /// Single replay-client deployment: bypass the routing table
    #[clap(long)]
    pub single: bool,

    /// Coalesce upstream notifications and flush them on a short timer
    #[clap(long)]
    pub combined: bool,

    /// Move netlink verdicts and upstream forwarding to worker threads
    #[clap(long)]
    pub threaded: bool,

    /// Staging ring capacity in slots (threaded mode)
    #[clap(long)]
    pub pool_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Ipq,
    Nfqueue,
}

impl From<BackendArg> for intercept_core::Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Ipq => Self::Ipq,
            BackendArg::Nfqueue => Self::Nfqueue,
        }
    }
}
