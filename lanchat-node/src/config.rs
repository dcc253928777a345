//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanchat_core::relay::{
    RelayConfig, RelayMode, DEFAULT_MAX_LINE_LEN, DEFAULT_OUTBOX_CAPACITY, DEFAULT_SEEN_CACHE_SIZE,
};
use lanchat_core::{DEFAULT_NAMESPACE, DEFAULT_PROTOCOL_ID};
use serde::Deserialize;

/// Node configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_LISTEN_HOST, LANCHAT_LISTEN_PORT, LANCHAT_DISCOVERY_PORT,
/// LANCHAT_PROTOCOL_ID, LANCHAT_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Application protocol tag; must match on both ends (default "/chat/1.0.0").
    #[serde(default = "default_protocol_id")]
    pub protocol_id: String,
    /// Transport listen host (default loopback only).
    #[serde(default = "default_listen_host")]
    pub listen_host: IpAddr,
    /// Transport listen port (default 0: pick an ephemeral port).
    #[serde(default)]
    pub listen_port: u16,
    /// Enable LAN discovery (default true).
    #[serde(default = "default_true")]
    pub discovery: bool,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Only peers announcing the same namespace are connected (default "meet").
    #[serde(default = "default_namespace")]
    pub discovery_namespace: String,
    /// "fan_out" (default) or "point_to_point".
    #[serde(default)]
    pub relay_mode: RelayMode,
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    #[serde(default = "default_seen_cache_size")]
    pub seen_cache_size: usize,
    /// tracing filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_protocol_id() -> String {
    DEFAULT_PROTOCOL_ID.to_string()
}
fn default_listen_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_true() -> bool {
    true
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
fn default_outbox_capacity() -> usize {
    DEFAULT_OUTBOX_CAPACITY
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_max_line_len() -> usize {
    DEFAULT_MAX_LINE_LEN
}
fn default_seen_cache_size() -> usize {
    DEFAULT_SEEN_CACHE_SIZE
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_id: default_protocol_id(),
            listen_host: default_listen_host(),
            listen_port: 0,
            discovery: true,
            discovery_port: default_discovery_port(),
            discovery_namespace: default_namespace(),
            relay_mode: RelayMode::default(),
            outbox_capacity: default_outbox_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_line_len: default_max_line_len(),
            seen_cache_size: default_seen_cache_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.listen_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            mode: self.relay_mode,
            outbox_capacity: self.outbox_capacity,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            max_line_len: self.max_line_len,
            seen_cache_size: self.seen_cache_size,
        }
    }

    /// Apply LANCHAT_* overrides. `var` looks up one variable.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(s) = var("LANCHAT_LISTEN_HOST") {
            self.listen_host = parse_env("LANCHAT_LISTEN_HOST", &s)?;
        }
        if let Some(s) = var("LANCHAT_LISTEN_PORT") {
            self.listen_port = parse_env("LANCHAT_LISTEN_PORT", &s)?;
        }
        if let Some(s) = var("LANCHAT_DISCOVERY_PORT") {
            self.discovery_port = parse_env("LANCHAT_DISCOVERY_PORT", &s)?;
        }
        if let Some(s) = var("LANCHAT_PROTOCOL_ID") {
            self.protocol_id = s;
        }
        if let Some(s) = var("LANCHAT_LOG") {
            self.log_level = s;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env {
        name,
        value: value.to_string(),
    })
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
    #[error("invalid value {value:?} for {name}")]
    Env { name: &'static str, value: String },
}

/// Load config: defaults, then the config file (explicit path or first existing
/// default location), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.protocol_id, "/chat/1.0.0");
        assert_eq!(c.listen_addr(), "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
        assert_eq!(c.relay_mode, RelayMode::FanOut);
        assert!(c.discovery);
        assert_eq!(c.discovery_namespace, "meet");
    }

    #[test]
    fn file_values_override_defaults() {
        let c: Config = toml::from_str(
            r#"
            listen_host = "0.0.0.0"
            listen_port = 4001
            relay_mode = "point_to_point"
            write_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:4001".parse::<std::net::SocketAddr>().unwrap());
        let relay = c.relay_config();
        assert_eq!(relay.mode, RelayMode::PointToPoint);
        assert_eq!(relay.write_timeout, Duration::from_millis(250));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("LANCHAT_LISTEN_PORT", "5000"),
            ("LANCHAT_PROTOCOL_ID", "/chat/2.0.0"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.protocol_id, "/chat/2.0.0");
        assert_eq!(c.discovery_port, 45680);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut c = Config::default();
        let err = c
            .apply_env(|k| (k == "LANCHAT_DISCOVERY_PORT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "LANCHAT_DISCOVERY_PORT", .. }));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load(Some(Path::new("/nonexistent/lanchat.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
