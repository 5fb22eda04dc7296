//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use peerchat_core::{DEFAULT_PROTOCOL_ID, DEFAULT_RENDEZVOUS};
use serde::Deserialize;

/// Node configuration. File: ~/.config/peerchat/config.toml or /etc/peerchat/config.toml.
/// Env overrides: PEERCHAT_USERNAME, PEERCHAT_RENDEZVOUS, PEERCHAT_DISCOVERY_PORT,
/// PEERCHAT_TRANSPORT_PORT, PEERCHAT_BOOTSTRAP (comma-separated host:port list).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name for posts; prompted for when absent.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_rendezvous")]
    pub rendezvous: String,
    #[serde(default = "default_protocol_id")]
    pub protocol_id: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Stream (TCP) listen port (default 45680).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Discovery UDP port (default 45681).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Extra unicast discovery endpoints, `host:port`.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_search_window_secs")]
    pub search_window_secs: u64,
    /// Absent: a failed dial ignores the peer for the rest of the process.
    #[serde(default)]
    pub ignore_ttl_secs: Option<u64>,
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
}

fn default_rendezvous() -> String {
    DEFAULT_RENDEZVOUS.to_string()
}
fn default_protocol_id() -> String {
    DEFAULT_PROTOCOL_ID.to_string()
}
fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}
fn default_transport_port() -> u16 {
    45680
}
fn default_discovery_port() -> u16 {
    45681
}
fn default_search_window_secs() -> u64 {
    20
}
fn default_max_line_len() -> usize {
    64 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: None,
            rendezvous: default_rendezvous(),
            protocol_id: default_protocol_id(),
            listen_address: default_listen_address(),
            transport_port: default_transport_port(),
            discovery_port: default_discovery_port(),
            bootstrap_peers: Vec::new(),
            search_window_secs: default_search_window_secs(),
            ignore_ttl_secs: None,
            max_line_len: default_max_line_len(),
        }
    }
}

impl Config {
    pub fn search_window(&self) -> Duration {
        Duration::from_secs(self.search_window_secs)
    }

    pub fn ignore_ttl(&self) -> Option<Duration> {
        self.ignore_ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

/// Load an explicit config file, then env vars. Unlike `load`, a bad file is an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut c = parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PEERCHAT_USERNAME") {
        if !s.trim().is_empty() {
            c.username = Some(s.trim().to_string());
        }
    }
    if let Some(s) = var("PEERCHAT_RENDEZVOUS") {
        if !s.is_empty() {
            c.rendezvous = s;
        }
    }
    if let Some(s) = var("PEERCHAT_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Some(s) = var("PEERCHAT_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Some(s) = var("PEERCHAT_BOOTSTRAP") {
        c.bootstrap_peers = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring bad config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
