//! Load config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use x11q_core::MAX_RECORD_TTL;

use crate::directory::LookupPolicy;
use crate::session::Settings;

/// Daemon configuration. File: ~/.config/x11q/config.toml or /etc/x11q/config.toml.
/// Env overrides: X11Q_IDENTITY, X11Q_RENDEZVOUS (comma separated), X11Q_DIRECTORY_URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Key store path (default ~/.config/x11q/identity.key).
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    /// Rendezvous nodes for hole-punch coordination and relay.
    #[serde(default)]
    pub rendezvous: Vec<SocketAddr>,
    /// Directory HTTP service; none means word codes are unavailable.
    #[serde(default)]
    pub directory_url: Option<String>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
    #[serde(default = "default_republish_secs")]
    pub republish_secs: u64,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_path_upgrade")]
    pub path_upgrade: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    pub direct_ms: u64,
    pub hole_punch_ms: u64,
    pub relay_ms: u64,
    pub handshake_ms: u64,
    pub auth_ms: u64,
    pub lookup_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            direct_ms: 3_000,
            hole_punch_ms: 8_000,
            relay_ms: 10_000,
            handshake_ms: 10_000,
            auth_ms: 15_000,
            lookup_ms: 30_000,
        }
    }
}

fn default_record_ttl_secs() -> u64 {
    120
}
fn default_republish_secs() -> u64 {
    30
}
fn default_max_failed_attempts() -> u32 {
    3
}
fn default_path_upgrade() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_path: None,
            rendezvous: Vec::new(),
            directory_url: None,
            timeouts: Timeouts::default(),
            record_ttl_secs: default_record_ttl_secs(),
            republish_secs: default_republish_secs(),
            max_failed_attempts: default_max_failed_attempts(),
            path_upgrade: default_path_upgrade(),
        }
    }
}

impl Config {
    pub fn settings(&self) -> Settings {
        let t = &self.timeouts;
        Settings {
            direct_timeout: Duration::from_millis(t.direct_ms),
            hole_punch_timeout: Duration::from_millis(t.hole_punch_ms),
            relay_timeout: Duration::from_millis(t.relay_ms),
            handshake_timeout: Duration::from_millis(t.handshake_ms),
            auth_timeout: Duration::from_millis(t.auth_ms),
            lookup: LookupPolicy {
                deadline: Duration::from_millis(t.lookup_ms),
                ..LookupPolicy::default()
            },
            record_ttl: Duration::from_secs(self.record_ttl_secs).min(MAX_RECORD_TTL),
            republish_every: Duration::from_secs(self.republish_secs.max(1)),
            max_failed_attempts: self.max_failed_attempts,
            path_upgrade: self.path_upgrade,
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("X11Q_IDENTITY") {
            self.identity_path = Some(PathBuf::from(p));
        }
        if let Some(s) = var("X11Q_RENDEZVOUS") {
            let nodes: Result<Vec<SocketAddr>, _> = s
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::parse)
                .collect();
            match nodes {
                Ok(nodes) => self.rendezvous = nodes,
                Err(e) => tracing::warn!(error = %e, "ignoring X11Q_RENDEZVOUS"),
            }
        }
        if let Some(url) = var("X11Q_DIRECTORY_URL") {
            self.directory_url = Some(url);
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/x11q/config.toml"));
    }
    out.push(PathBuf::from("/etc/x11q/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => {
                    tracing::warn!(path = %p.display(), error = %e, "invalid config, using defaults")
                }
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "unreadable config, using defaults")
                }
            }
            break;
        }
    }
    None
}
