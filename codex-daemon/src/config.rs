//! Load config from file and environment.

use std::path::PathBuf;

use codex_bridge::{LogLevel, NodeConfig};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/codex/config.toml or /etc/codex/config.toml.
/// Env overrides: CODEX_DATA_DIR, CODEX_LOG_LEVEL, CODEX_LISTEN_ADDRS, CODEX_DISC_PORT.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Log native node events at info level.
    #[serde(default)]
    pub log_events: bool,
    /// Passed to the node creation call as JSON.
    #[serde(default)]
    pub node: NodeConfig,
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(dir) = var("CODEX_DATA_DIR") {
        c.node.data_dir = Some(dir);
    }
    if let Some(s) = var("CODEX_LOG_LEVEL") {
        match s.parse::<LogLevel>() {
            Ok(level) => c.node.log_level = Some(level),
            Err(e) => tracing::warn!(error = %e, "ignoring CODEX_LOG_LEVEL"),
        }
    }
    if let Some(s) = var("CODEX_LISTEN_ADDRS") {
        let addrs: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
        c.node.listen_addrs = Some(addrs);
    }
    if let Some(s) = var("CODEX_DISC_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.node.discovery_port = Some(p);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/codex/config.toml"));
    }
    out.push(PathBuf::from("/etc/codex/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => {
                        tracing::info!(path = %p.display(), "loaded config");
                        return Some(c);
                    }
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "invalid config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config"),
            }
            break;
        }
    }
    None
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}
