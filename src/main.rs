//! interceptd, the TCP replay interception server.
//!
//! Sits on the replica host behind an ip_queue/NFQUEUE firewall rule,
//! suppresses response packets that belong to replayed traffic, and hands
//! each suppressed packet's fingerprint back to the replay client that owns
//! the flow. Run `interceptd --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = cli::Cli::parse();
    let settings = config::build_settings(&cli)?;
    tracing::info!(
        "starting: backend={:?} single={} combined={} threaded={} whitelist={} entries",
        settings.backend,
        settings.single,
        settings.combined,
        settings.threaded,
        settings.passed_ips.len()
    );

    let mut server = intercept_core::InterceptServer::new(settings)?;
    server.run()
}
