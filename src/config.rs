//! Daemon configuration.
//!
//! Loaded from a YAML file, validated before any socket is opened. Schema
//! problems are fatal at startup; the router never limps along with a
//! half-understood configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub messagedirector: MdConfig,
    /// UDP target for event log traffic ("host:port" or bare host).
    pub eventlogger: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonConfig {
    /// Logged identity of this daemon.
    pub name: String,
    /// Logged contact or info URL.
    pub url: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            name: "<unnamed>".to_string(),
            url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct MdConfig {
    /// Listen address for downstream peers ("host:port"). No listener
    /// when unset.
    pub bind: Option<String>,
    /// Upstream router to connect to ("host:port"). Root of the tree
    /// when unset.
    pub connect: Option<String>,
    /// Drain the routing queue with a worker pool instead of inline.
    pub threaded: bool,
    /// Expect a PROXY protocol preamble on inbound connections.
    pub haproxy: bool,
    /// Per-connection write deadline in milliseconds; 0 disables it.
    pub write_timeout_ms: u64,
    /// Per-connection send queue cap in bytes; 0 means unlimited.
    pub write_buffer_max: u64,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            bind: None,
            connect: None,
            threaded: true,
            haproxy: false,
            write_timeout_ms: 0,
            write_buffer_max: 0,
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bind) = &self.messagedirector.bind {
            resolve("messagedirector.bind", bind)?;
        }
        if let Some(connect) = &self.messagedirector.connect {
            resolve("messagedirector.connect", connect)?;
        }
        Ok(())
    }

    /// Resolved listen address, if a listener is configured.
    pub fn bind_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.messagedirector
            .bind
            .as_deref()
            .map(|s| resolve("messagedirector.bind", s))
            .transpose()
    }

    /// Resolved upstream address, if an upstream is configured.
    pub fn connect_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.messagedirector
            .connect
            .as_deref()
            .map(|s| resolve("messagedirector.connect", s))
            .transpose()
    }
}

fn resolve(key: &'static str, spec: &str) -> Result<SocketAddr, ConfigError> {
    spec.to_socket_addrs()
        .map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ConfigError::Invalid {
            key,
            reason: format!("'{spec}' resolved to no addresses"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.daemon.name, "<unnamed>");
        assert_eq!(config.daemon.url, "");
        assert!(config.messagedirector.threaded);
        assert!(!config.messagedirector.haproxy);
        assert!(config.messagedirector.bind.is_none());
        assert!(config.messagedirector.connect.is_none());
        assert!(config.eventlogger.is_none());
    }

    #[test]
    fn test_full_document() {
        let config = Config::from_yaml(
            r#"
daemon:
  name: "core-shard"
  url: "md://core.example.com"
messagedirector:
  bind: "127.0.0.1:7199"
  connect: "127.0.0.1:7299"
  threaded: false
  haproxy: true
  write_timeout_ms: 5000
  write_buffer_max: 262144
eventlogger: "127.0.0.1:7197"
"#,
        )
        .unwrap();

        assert_eq!(config.daemon.name, "core-shard");
        assert!(!config.messagedirector.threaded);
        assert!(config.messagedirector.haproxy);
        assert_eq!(config.messagedirector.write_timeout_ms, 5000);
        assert_eq!(
            config.bind_addr().unwrap().unwrap().to_string(),
            "127.0.0.1:7199"
        );
        assert_eq!(
            config.connect_addr().unwrap().unwrap().to_string(),
            "127.0.0.1:7299"
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = Config::from_yaml("messagedirector:\n  legacy_mode: true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_bad_address_rejected() {
        let err = Config::from_yaml("messagedirector:\n  bind: \"not an address\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "messagedirector.bind"));
    }
}
