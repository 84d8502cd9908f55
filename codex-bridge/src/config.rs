//! Node configuration blob passed to the creation call.
//!
//! Every field is optional and omitted from the JSON when unset, so defaults stay with
//! the native component.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Notice,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Notice => "NOTICE",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = BridgeError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" => Ok(LogLevel::Fatal),
            _ => Err(BridgeError::InvalidArgument(format!("unknown log level {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Auto,
    Colors,
    NoColors,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Fs,
    Sqlite,
    Leveldb,
}

/// Creation-call configuration, serialized with the native component's kebab-case keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,
    #[serde(default, rename = "metrics", skip_serializing_if = "Option::is_none")]
    pub metrics_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addrs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<String>,
    #[serde(default, rename = "disc-port", skip_serializing_if = "Option::is_none")]
    pub discovery_port: Option<u16>,
    #[serde(default, rename = "net-privkey", skip_serializing_if = "Option::is_none")]
    pub net_priv_key_file: Option<String>,
    /// SPRs of the bootstrap nodes.
    #[serde(default, rename = "bootstrap-node", skip_serializing_if = "Option::is_none")]
    pub bootstrap_nodes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_peers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_kind: Option<RepoKind>,
    /// Bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_quota: Option<u64>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_ttl: Option<u64>,
    /// Block maintenance interval, seconds.
    #[serde(default, rename = "block-mi", skip_serializing_if = "Option::is_none")]
    pub block_maintenance_interval: Option<u64>,
    /// Blocks checked per maintenance run.
    #[serde(default, rename = "block-mn", skip_serializing_if = "Option::is_none")]
    pub block_maintenance_blocks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl NodeConfig {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_empty_object() {
        assert_eq!(NodeConfig::default().to_json().unwrap(), "{}");
    }

    #[test]
    fn keys_match_native_names() {
        let c = NodeConfig {
            log_level: Some(LogLevel::Warn),
            data_dir: Some("./data".into()),
            discovery_port: Some(8090),
            bootstrap_nodes: Some(vec!["spr:abc".into()]),
            block_maintenance_interval: Some(60),
            metrics_enabled: Some(false),
            repo_kind: Some(RepoKind::Sqlite),
            ..Default::default()
        };
        let v: serde_json::Value = serde_json::from_str(&c.to_json().unwrap()).unwrap();
        assert_eq!(v["log-level"], "WARN");
        assert_eq!(v["data-dir"], "./data");
        assert_eq!(v["disc-port"], 8090);
        assert_eq!(v["bootstrap-node"][0], "spr:abc");
        assert_eq!(v["block-mi"], 60);
        assert_eq!(v["metrics"], false);
        assert_eq!(v["repo-kind"], "sqlite");
        assert_eq!(v.as_object().unwrap().len(), 7);
    }

    #[test]
    fn log_level_parses_any_case() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("NOTICE".parse::<LogLevel>().unwrap(), LogLevel::Notice);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Fatal.to_string(), "FATAL");
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(serde_json::from_str::<NodeConfig>(r#"{"data-dir":"x","colour":1}"#).is_err());
    }
}
