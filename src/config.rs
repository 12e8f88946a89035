//! Service settings for Divvy.
//!
//! Settings are layered: built-in defaults, then an optional settings file,
//! then `DIVVY_*` environment variables (`DIVVY_SERVER__LISTEN_ADDR`,
//! `DIVVY_BACKEND__REDIS_URL`, ...). Command line flags are applied on top by
//! the binary. Quota rules live in a separate rule document, see
//! [`crate::ratelimit::RuleDocument`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DivvyError, Result};
use crate::ratelimit::{RedisBackendConfig, DEFAULT_KEY_PREFIX};
use crate::server::DEFAULT_PORT;

/// Main configuration for the Divvy service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DivvyConfig {
    /// Protocol server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Protocol server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the line protocol is served on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared counters in Redis
    #[default]
    Redis,
    /// Process-local counters
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace for bucket keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the memory backend drops expired buckets, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl BackendConfig {
    pub fn redis(&self) -> RedisBackendConfig {
        RedisBackendConfig {
            url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_purge_interval() -> u64 {
    60
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Exporter port; the exporter is disabled when unset
    #[serde(default)]
    pub port: Option<u16>,

    /// Address the exporter binds to
    #[serde(default = "default_metrics_bind")]
    pub bind_addr: IpAddr,

    /// HTTP path metrics are served on
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: None,
            bind_addr: default_metrics_bind(),
            path: default_metrics_path(),
        }
    }
}

impl MetricsConfig {
    /// The exporter address, if the exporter is enabled.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::new(self.bind_addr, port))
    }
}

fn default_metrics_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl DivvyConfig {
    /// Load settings from an optional file overlaid with `DIVVY_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DIVVY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DivvyError::Config(e.to_string()))
    }
}
