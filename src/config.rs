//! `interceptd.toml` configuration, merged with CLI flags.

use anyhow::{Context, Result};
use intercept_core::{Backend, Settings};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::cli::Cli;

/// Optional file-based configuration. Every field mirrors a CLI flag; the
/// flag wins when both are given.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
    #[serde(default)]
    pub passed_ips: Vec<Ipv4Addr>,
    pub hash_size: Option<usize>,
    pub timeout: Option<u64>,
    pub backend: Option<Backend>,
    pub queue_num: Option<u16>,
    pub single: Option<bool>,
    pub combined: Option<bool>,
    pub threaded: Option<bool>,
    pub pool_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }
}

/// Defaults ← file ← flags.
pub fn build_settings(cli: &Cli) -> Result<Settings> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let mut settings = Settings::default();

    if let Some(ip) = file.ip {
        settings.ip = ip;
    }
    if let Some(port) = file.port {
        settings.port = port;
    }
    if !file.passed_ips.is_empty() {
        settings.passed_ips = file.passed_ips;
    }
    if let Some(hash_size) = file.hash_size {
        settings.hash_size = hash_size;
    }
    if let Some(timeout) = file.timeout {
        settings.timeout = timeout;
    }
    if let Some(backend) = file.backend {
        settings.backend = backend;
    }
    if let Some(queue_num) = file.queue_num {
        settings.queue_num = queue_num;
    }
    settings.single = file.single.unwrap_or(settings.single);
    settings.combined = file.combined.unwrap_or(settings.combined);
    settings.threaded = file.threaded.unwrap_or(settings.threaded);
    if let Some(pool_size) = file.pool_size {
        settings.pool_size = pool_size;
    }

    if let Some(ip) = cli.ip {
        settings.ip = ip;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if !cli.passed_ips.is_empty() {
        settings.passed_ips = cli.passed_ips.clone();
    }
    if let Some(hash_size) = cli.hash_size {
        settings.hash_size = hash_size;
    }
    if let Some(timeout) = cli.timeout {
        settings.timeout = timeout;
    }
    if let Some(backend) = cli.backend {
        settings.backend = backend.into();
    }
    if let Some(queue_num) = cli.queue_num {
        settings.queue_num = queue_num;
    }
    if cli.single {
        settings.single = true;
    }
    if cli.combined {
        settings.combined = true;
    }
    if cli.threaded {
        settings.threaded = true;
    }
    if let Some(pool_size) = cli.pool_size {
        settings.pool_size = pool_size;
    }

    if settings.passed_ips.is_empty() {
        tracing::warn!("whitelist is empty: every queued response packet will be dropped");
    }

    Ok(settings)
}
