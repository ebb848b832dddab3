//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use p2pft_core::{ConfigError, TransferConfig};

/// Node configuration. File: $P2PFT_CONFIG, ~/.config/p2pft/config.toml or /etc/p2pft/config.toml.
/// Env overrides: P2PFT_BASE_PORT, P2PFT_DIRECTORY_HOST, P2PFT_DIRECTORY_PORT, P2PFT_CHUNK_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// First listening port tried (default 27891).
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Ports `base_port + 0 .. base_port + max_port_offset` are tried in turn (default 100).
    #[serde(default = "default_max_port_offset")]
    pub max_port_offset: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_directory_host")]
    pub directory_host: String,
    #[serde(default = "default_directory_port")]
    pub directory_port: u16,
    /// Host announced to the directory. Defaults to our address on the directory connection.
    #[serde(default)]
    pub advertise_host: Option<String>,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Delay between chunk frames on the send path.
    #[serde(default = "default_send_pacing_ms")]
    pub send_pacing_ms: u64,
    /// Identical monitor samples after a re-request before asking again.
    #[serde(default = "default_stall_rearm_samples")]
    pub stall_rearm_samples: u32,
    /// Files and folders announced at startup.
    #[serde(default)]
    pub share: Vec<PathBuf>,
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_base_port() -> u16 {
    27891
}
fn default_max_port_offset() -> u16 {
    100
}
fn default_max_connections() -> usize {
    512
}
fn default_read_buffer_size() -> usize {
    8192
}
fn default_directory_host() -> String {
    "127.0.0.1".to_string()
}
fn default_directory_port() -> u16 {
    27890
}
fn default_monitor_interval_ms() -> u64 {
    3000
}
fn default_send_pacing_ms() -> u64 {
    5
}
fn default_stall_rearm_samples() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            max_port_offset: default_max_port_offset(),
            max_connections: default_max_connections(),
            read_buffer_size: default_read_buffer_size(),
            directory_host: default_directory_host(),
            directory_port: default_directory_port(),
            advertise_host: None,
            monitor_interval_ms: default_monitor_interval_ms(),
            send_pacing_ms: default_send_pacing_ms(),
            stall_rearm_samples: default_stall_rearm_samples(),
            share: Vec::new(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn send_pacing(&self) -> Duration {
        Duration::from_millis(self.send_pacing_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate()
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("P2PFT_BASE_PORT").and_then(|s| s.parse().ok()) {
            self.base_port = p;
        }
        if let Some(h) = var("P2PFT_DIRECTORY_HOST") {
            self.directory_host = h;
        }
        if let Some(p) = var("P2PFT_DIRECTORY_PORT").and_then(|s| s.parse().ok()) {
            self.directory_port = p;
        }
        if let Some(c) = var("P2PFT_CHUNK_SIZE").and_then(|s| s.parse().ok()) {
            self.transfer.chunk_size = c;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars; validate.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("P2PFT_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/p2pft/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2pft/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let s = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read config");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring invalid config");
            None
        }
    }
}
