//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Server configuration. File: ~/.config/lanbeam/server.toml or /etc/lanbeam/server.toml.
/// Env overrides: LANBEAM_BIND, PORT, LANBEAM_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP and relay socket listen address (default 0.0.0.0:9000).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9000))
}
fn default_log_filter() -> String {
    "info,lanbeam_server=debug".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_filter: default_log_filter(),
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
/// A config file that exists but does not parse is an error.
pub fn load() -> anyhow::Result<Config> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(a) = var("LANBEAM_BIND").and_then(|s| s.parse::<SocketAddr>().ok()) {
        c.bind_addr = a;
    }
    if let Some(p) = var("PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.bind_addr.set_port(p);
    }
    if let Some(f) = var("LANBEAM_LOG") {
        c.log_filter = f;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/lanbeam/server.toml"));
    }
    out.push(PathBuf::from("/etc/lanbeam/server.toml"));
    out
}

fn load_file() -> anyhow::Result<Option<Config>> {
    for p in config_paths() {
        if p.exists() {
            let s = std::fs::read_to_string(&p)
                .with_context(|| format!("reading {}", p.display()))?;
            let c = toml::from_str::<Config>(&s)
                .with_context(|| format!("parsing {}", p.display()))?;
            return Ok(Some(c));
        }
    }
    Ok(None)
}
