//! Tunable timings and ports.
//!
//! Defaults live in the embedded `config.toml`; a user file at
//! `<config dir>/podium/config.toml` may override any individual key.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid discovery target {0:?}")]
    Target(String),
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    client: ClientSection,
    #[serde(default)]
    queue: QueueSection,
    #[serde(default)]
    discovery: DiscoverySection,
    #[serde(default)]
    role: RoleSection,
    #[serde(default)]
    file_server: FileServerSection,
}

#[derive(Deserialize, Default)]
struct ServerSection {
    port: Option<u16>,
    bind_attempts: Option<u32>,
    bind_retry_delay_ms: Option<u64>,
    bind_retry_late_delay_ms: Option<u64>,
    accept_poll_ms: Option<u64>,
    shutdown_join_ms: Option<u64>,
    port_release_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct ClientSection {
    heartbeat_interval_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct QueueSection {
    poll_timeout_ms: Option<u64>,
    ttl_ms: Option<u64>,
    dedup_capacity: Option<usize>,
    max_queue_size: Option<usize>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    out_of_order_tolerance_ms: Option<u64>,
    maintenance_interval_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct DiscoverySection {
    port: Option<u16>,
    announce_interval_ms: Option<u64>,
    receive_timeout_ms: Option<u64>,
    window_ms: Option<u64>,
    targets: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct RoleSection {
    settle_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct FileServerSection {
    port: Option<u16>,
}

/// Conductor-side transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_attempts: u32,
    pub bind_retry_delay: Duration,
    /// Used from the mid-point of the bind attempts onwards.
    pub bind_retry_late_delay: Duration,
    pub accept_poll: Duration,
    pub shutdown_join: Duration,
    pub port_release: Duration,
    pub write_timeout: Duration,
}

/// Performer-side transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

/// Message reliability settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub poll_timeout: Duration,
    pub ttl: Duration,
    pub dedup_capacity: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub out_of_order_tolerance: Duration,
    pub maintenance_interval: Duration,
}

/// UDP discovery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub announce_interval: Duration,
    pub receive_timeout: Duration,
    pub window: Duration,
    pub targets: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub queue: QueueConfig,
    pub discovery: DiscoveryConfig,
    /// Pause between tearing down one role and starting the next.
    pub role_settle: Duration,
    pub file_server_port: u16,
}

impl NetConfig {
    /// Embedded defaults merged with the user's config file, if any.
    pub fn load() -> Self {
        let mut base = embedded();

        if let Some(path) = user_config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                        Ok(user) => merge(&mut base, user),
                        Err(e) => {
                            log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                        }
                    },
                    Err(e) => {
                        log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                    }
                }
            }
        }

        match resolve(base) {
            Ok(config) => config,
            Err(e) => {
                log::warn!(target: "config", "falling back to built-in config: {}", e);
                Self::default()
            }
        }
    }

    /// Parse `text` as overrides on top of the embedded defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut base = embedded();
        let user: ConfigFile = toml::from_str(text)?;
        merge(&mut base, user);
        resolve(base)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        resolve(embedded()).expect("embedded config.toml resolves")
    }
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("podium").join("config.toml"))
}

fn embedded() -> ConfigFile {
    toml::from_str(DEFAULT_CONFIG).expect("Failed to parse embedded config.toml")
}

fn ms(value: Option<u64>, fallback: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(fallback))
}

fn resolve(file: ConfigFile) -> Result<NetConfig, ConfigError> {
    let s = file.server;
    let c = file.client;
    let q = file.queue;
    let d = file.discovery;

    let write_timeout = ms(s.write_timeout_ms, 5000);

    let targets = d
        .targets
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.trim().parse::<Ipv4Addr>().map_err(|_| ConfigError::Target(t)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NetConfig {
        server: ServerConfig {
            port: s.port.unwrap_or(9090),
            bind_attempts: s.bind_attempts.unwrap_or(5).max(1),
            bind_retry_delay: ms(s.bind_retry_delay_ms, 800),
            bind_retry_late_delay: ms(s.bind_retry_late_delay_ms, 1000),
            accept_poll: ms(s.accept_poll_ms, 25).max(Duration::from_millis(1)),
            shutdown_join: ms(s.shutdown_join_ms, 1000),
            port_release: ms(s.port_release_ms, 500),
            write_timeout,
        },
        client: ClientConfig {
            heartbeat_interval: ms(c.heartbeat_interval_ms, 30_000),
            reconnect_base_delay: ms(c.reconnect_base_delay_ms, 2000),
            max_reconnect_attempts: c.max_reconnect_attempts.unwrap_or(5),
            connect_timeout: ms(c.connect_timeout_ms, 10_000),
            write_timeout,
        },
        queue: QueueConfig {
            poll_timeout: ms(q.poll_timeout_ms, 100),
            ttl: ms(q.ttl_ms, 30_000),
            dedup_capacity: q.dedup_capacity.unwrap_or(100).max(1),
            max_queue_size: q.max_queue_size.unwrap_or(1000),
            max_retries: q.max_retries.unwrap_or(3),
            retry_backoff: ms(q.retry_backoff_ms, 100),
            out_of_order_tolerance: ms(q.out_of_order_tolerance_ms, 500),
            maintenance_interval: ms(q.maintenance_interval_ms, 5000),
        },
        discovery: DiscoveryConfig {
            port: d.port.unwrap_or(9091),
            announce_interval: ms(d.announce_interval_ms, 3000),
            receive_timeout: ms(d.receive_timeout_ms, 2000).max(Duration::from_millis(1)),
            window: ms(d.window_ms, 15_000),
            targets,
        },
        role_settle: ms(file.role.settle_ms, 1000),
        file_server_port: file.file_server.port.unwrap_or(8090),
    })
}

fn merge(base: &mut ConfigFile, user: ConfigFile) {
    fn take<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }

    let (b, u) = (&mut base.server, user.server);
    take(&mut b.port, u.port);
    take(&mut b.bind_attempts, u.bind_attempts);
    take(&mut b.bind_retry_delay_ms, u.bind_retry_delay_ms);
    take(&mut b.bind_retry_late_delay_ms, u.bind_retry_late_delay_ms);
    take(&mut b.accept_poll_ms, u.accept_poll_ms);
    take(&mut b.shutdown_join_ms, u.shutdown_join_ms);
    take(&mut b.port_release_ms, u.port_release_ms);
    take(&mut b.write_timeout_ms, u.write_timeout_ms);

    let (b, u) = (&mut base.client, user.client);
    take(&mut b.heartbeat_interval_ms, u.heartbeat_interval_ms);
    take(&mut b.reconnect_base_delay_ms, u.reconnect_base_delay_ms);
    take(&mut b.max_reconnect_attempts, u.max_reconnect_attempts);
    take(&mut b.connect_timeout_ms, u.connect_timeout_ms);

    let (b, u) = (&mut base.queue, user.queue);
    take(&mut b.poll_timeout_ms, u.poll_timeout_ms);
    take(&mut b.ttl_ms, u.ttl_ms);
    take(&mut b.dedup_capacity, u.dedup_capacity);
    take(&mut b.max_queue_size, u.max_queue_size);
    take(&mut b.max_retries, u.max_retries);
    take(&mut b.retry_backoff_ms, u.retry_backoff_ms);
    take(&mut b.out_of_order_tolerance_ms, u.out_of_order_tolerance_ms);
    take(&mut b.maintenance_interval_ms, u.maintenance_interval_ms);

    let (b, u) = (&mut base.discovery, user.discovery);
    take(&mut b.port, u.port);
    take(&mut b.announce_interval_ms, u.announce_interval_ms);
    take(&mut b.receive_timeout_ms, u.receive_timeout_ms);
    take(&mut b.window_ms, u.window_ms);
    take(&mut b.targets, u.targets);

    take(&mut base.role.settle_ms, user.role.settle_ms);
    take(&mut base.file_server.port, user.file_server.port);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.bind_attempts, 5);
        assert_eq!(config.client.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.client.reconnect_base_delay, Duration::from_secs(2));
        assert_eq!(config.client.max_reconnect_attempts, 5);
        assert_eq!(config.queue.ttl, Duration::from_secs(30));
        assert_eq!(config.queue.dedup_capacity, 100);
        assert_eq!(config.queue.max_queue_size, 1000);
        assert_eq!(config.queue.out_of_order_tolerance, Duration::from_millis(500));
        assert_eq!(config.discovery.port, 9091);
        assert_eq!(config.discovery.window, Duration::from_secs(15));
        assert!(config.discovery.targets.is_empty());
        assert_eq!(config.file_server_port, 8090);
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config = NetConfig::from_toml_str(
            r#"
            [server]
            port = 9100

            [discovery]
            targets = ["127.0.0.1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind_attempts, 5);
        assert_eq!(config.discovery.targets, vec![Ipv4Addr::LOCALHOST]);
        assert_eq!(config.discovery.announce_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_bad_target_is_an_error() {
        let err = NetConfig::from_toml_str("[discovery]\ntargets = [\"not-an-ip\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Target(_)));
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        assert!(matches!(
            NetConfig::from_toml_str("[server\nport = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client]\nheartbeat_interval_ms = 1500\n").unwrap();
        let config = NetConfig::from_path(&path).unwrap();
        assert_eq!(config.client.heartbeat_interval, Duration::from_millis(1500));
    }
}
