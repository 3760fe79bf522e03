//! Load config from file and environment.

use std::path::PathBuf;

use anyhow::Context;
use lanbeam_core::DeviceClass;
use serde::Deserialize;

/// Which transport to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Relay when the server is on loopback (both peers on one host),
    /// otherwise a direct data channel.
    #[default]
    Auto,
    Direct,
    Relay,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(TransportMode::Auto),
            "direct" => Ok(TransportMode::Direct),
            "relay" => Ok(TransportMode::Relay),
            other => Err(format!("unknown transport mode: {other}")),
        }
    }
}

/// Peer configuration. File: ~/.config/lanbeam/peer.toml or /etc/lanbeam/peer.toml.
/// Env overrides: LANBEAM_SERVER, LANBEAM_NAME, LANBEAM_DEVICE_TYPE,
/// LANBEAM_TRANSPORT, LANBEAM_DOWNLOAD_DIR, LANBEAM_AUTO_ACCEPT, LANBEAM_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Presence and relay server (default http://127.0.0.1:9000).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Name shown to other peers (default: hostname, else "Unknown Device").
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub device_type: DeviceClass,
    #[serde(default)]
    pub transport: TransportMode,
    /// ICE servers for direct connections.
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Where received files are written (default: current directory).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Accept every incoming offer without asking.
    #[serde(default)]
    pub auto_accept: bool,
    /// tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_server_url() -> String {
    "http://127.0.0.1:9000".to_string()
}
fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| lanbeam_core::directory::DEFAULT_DEVICE_NAME.to_string())
}
fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_log_filter() -> String {
    "warn,lanbeam_peer=info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            device_name: default_device_name(),
            device_type: DeviceClass::default(),
            transport: TransportMode::default(),
            stun_servers: default_stun_servers(),
            download_dir: default_download_dir(),
            auto_accept: false,
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
    if let Some(s) = var("LANBEAM_SERVER") {
        c.server_url = s;
    }
    if let Some(n) = var("LANBEAM_NAME").filter(|n| !n.trim().is_empty()) {
        c.device_name = n;
    }
    if let Some(t) = var("LANBEAM_DEVICE_TYPE").and_then(|s| s.parse().ok()) {
        c.device_type = t;
    }
    if let Some(m) = var("LANBEAM_TRANSPORT").and_then(|s| s.parse().ok()) {
        c.transport = m;
    }
    if let Some(d) = var("LANBEAM_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(d);
    }
    if let Some(a) = var("LANBEAM_AUTO_ACCEPT") {
        c.auto_accept = matches!(a.trim(), "1" | "true" | "yes");
    }
    if let Some(f) = var("LANBEAM_LOG") {
        c.log_filter = f;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/lanbeam/peer.toml"));
    }
    out.push(PathBuf::from("/etc/lanbeam/peer.toml"));
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn file_fields() {
        let c: Config = toml::from_str(
            "server_url = \"http://10.0.0.2:9000\"\ndevice_type = \"laptop\"\ntransport = \"relay\"\nauto_accept = true",
        )
        .unwrap();
        assert_eq!(c.server_url, "http://10.0.0.2:9000");
        assert_eq!(c.device_type, DeviceClass::Laptop);
        assert_eq!(c.transport, TransportMode::Relay);
        assert!(c.auto_accept);
        assert_eq!(c.stun_servers, default_stun_servers());
        assert!(toml::from_str::<Config>("server = \"x\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("LANBEAM_NAME", "Desk"),
                ("LANBEAM_DEVICE_TYPE", "Mobile"),
                ("LANBEAM_TRANSPORT", "direct"),
                ("LANBEAM_AUTO_ACCEPT", "1"),
            ]),
        );
        assert_eq!(c.device_name, "Desk");
        assert_eq!(c.device_type, DeviceClass::Mobile);
        assert_eq!(c.transport, TransportMode::Direct);
        assert!(c.auto_accept);
    }

    #[test]
    fn bad_env_values_ignored() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[("LANBEAM_TRANSPORT", "carrier-pigeon"), ("LANBEAM_NAME", "  ")]),
        );
        assert_eq!(c.transport, TransportMode::Auto);
        assert_ne!(c.device_name.trim(), "");
    }
}
