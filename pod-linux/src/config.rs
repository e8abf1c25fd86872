//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/pod/config.toml or /etc/pod/config.toml.
/// Env overrides: POD_STATE_FILE, POD_BRIDGE_PORT, POD_IDLE_TIMEOUT_SECS, POD_LOG.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Pod state file (default pod-state.toml).
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Radio bridge TCP port (default 7070).
    #[serde(default = "default_bridge_port")]
    pub bridge_port: u16,
    /// Seconds to wait for the next command before restarting the session (default 180).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Log filter when RUST_LOG is unset (default info).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("pod-state.toml")
}
fn default_bridge_port() -> u16 {
    7070
}
fn default_idle_timeout_secs() -> u64 {
    180
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            bridge_port: default_bridge_port(),
            idle_timeout_secs: default_idle_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |name| std::env::var(name).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("POD_STATE_FILE") {
        c.state_file = PathBuf::from(s);
    }
    if let Some(s) = var("POD_BRIDGE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.bridge_port = p;
        }
    }
    if let Some(s) = var("POD_IDLE_TIMEOUT_SECS") {
        if let Ok(t) = s.parse::<u64>() {
            c.idle_timeout_secs = t;
        }
    }
    if let Some(s) = var("POD_LOG") {
        c.log_level = s;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pod/config.toml"));
    }
    out.push(PathBuf::from("/etc/pod/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => eprintln!("ignoring {}: {}", p.display(), e),
                }
            }
            break;
        }
    }
    None
}
