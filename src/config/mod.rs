//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`JFAP_*`)
//! - CLI arguments (for the `jfap` binary)
//!
//! Defaults follow the legacy comms runtime properties (read-ahead watermarks,
//! chunking threshold, callback pool size).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JfapError, Result};
use crate::flow::DispatchMode;
use crate::protocol::CapabilityMask;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Capability overrides advertised during the handshake
    #[serde(default)]
    pub capabilities: CapabilityConfig,

    /// FAP version overrides
    #[serde(default)]
    pub versions: VersionConfig,

    /// Consumer read-ahead tuning
    #[serde(default)]
    pub read_ahead: ReadAheadConfig,

    /// Consumer callback dispatch
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| JfapError::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| JfapError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<config dir>/jfap/config.toml` if it exists, defaults otherwise
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("jfap").join("config.toml"))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("JFAP_HEARTBEAT_INTERVAL_MS") {
            config.connection.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_parse("JFAP_HEARTBEAT_TIMEOUT_MS") {
            config.connection.heartbeat_timeout_ms = v;
        }
        if let Some(v) = env_parse("JFAP_CHUNK_THRESHOLD") {
            config.connection.chunk_threshold = v;
        }
        if let Some(v) = env_parse("JFAP_MAX_TRANSMISSION_SIZE") {
            config.connection.max_transmission_size = v;
        }
        if let Some(v) = env_parse("JFAP_DISABLE_OPTIMIZED_TX") {
            config.capabilities.disable_optimized_tx = v;
        }
        if let Some(v) = env_parse("JFAP_NON_JAVA_BOOTSTRAP") {
            config.capabilities.non_java_bootstrap = v;
        }
        if let Some(v) = env_parse("JFAP_MAX_FAP_LEVEL") {
            config.versions.max_fap_level = Some(v);
        }
        if let Some(v) = env_parse("JFAP_RA_HIGH_QUEUE_BYTES") {
            config.read_ahead.high_queue_bytes = v;
        }
        if let Some(v) = env_parse("JFAP_INLINE_CALLBACKS") {
            config.dispatch.inline_callbacks = v;
        }

        config
    }

    /// Merge with another config (other takes precedence where it differs from defaults)
    pub fn merge(self, other: Self) -> Self {
        let conn_default = ConnectionConfig::default();
        Self {
            connection: ConnectionConfig {
                heartbeat_interval_ms: if other.connection.heartbeat_interval_ms
                    != conn_default.heartbeat_interval_ms
                {
                    other.connection.heartbeat_interval_ms
                } else {
                    self.connection.heartbeat_interval_ms
                },
                heartbeat_timeout_ms: if other.connection.heartbeat_timeout_ms
                    != conn_default.heartbeat_timeout_ms
                {
                    other.connection.heartbeat_timeout_ms
                } else {
                    self.connection.heartbeat_timeout_ms
                },
                chunk_threshold: if other.connection.chunk_threshold
                    != conn_default.chunk_threshold
                {
                    other.connection.chunk_threshold
                } else {
                    self.connection.chunk_threshold
                },
                ..other.connection
            },
            capabilities: other.capabilities,
            versions: VersionConfig {
                max_fap_level: other.versions.max_fap_level.or(self.versions.max_fap_level),
            },
            read_ahead: other.read_ahead,
            dispatch: other.dispatch,
        }
    }

    /// Reject settings that can never work
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_transmission_size == 0 {
            return Err(JfapError::Config(
                "max_transmission_size must be greater than zero".to_string(),
            ));
        }
        if self.connection.chunk_threshold == 0 {
            return Err(JfapError::Config(
                "chunk_threshold must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.read_ahead.low_queue_bytes_factor) {
            return Err(JfapError::Config(format!(
                "low_queue_bytes_factor {} must lie in 0.0..=1.0",
                self.read_ahead.low_queue_bytes_factor
            )));
        }
        if self.read_ahead.max_queue_bytes < self.read_ahead.high_queue_bytes {
            return Err(JfapError::Config(
                "max_queue_bytes must not be below high_queue_bytes".to_string(),
            ));
        }
        if !self.dispatch.inline_callbacks && self.dispatch.worker_pool_size == 0 {
            return Err(JfapError::Config(
                "worker_pool_size must be greater than zero when callbacks are not inline"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Per-connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Heartbeat interval in milliseconds (0 disables heartbeats)
    pub heartbeat_interval_ms: u32,

    /// Time allowed for a heartbeat response, in milliseconds
    pub heartbeat_timeout_ms: u32,

    /// Time the acceptor waits for the initial handshake, in milliseconds
    pub handshake_timeout_ms: u64,

    /// Time a close waits for the peer's acknowledgement, in milliseconds
    pub close_ack_timeout_ms: u64,

    /// Exchange reply timeout; derived from the heartbeat settings when unset
    pub exchange_timeout_ms: Option<u64>,

    /// Largest payload carried by one frame
    pub max_transmission_size: u32,

    /// Largest application message accepted
    pub max_message_size: u64,

    /// Payloads of at least this many bytes are sent as chunks
    pub chunk_threshold: usize,

    /// Product id flowed in the handshake
    pub product_id: u16,

    /// Product version flowed in the handshake (major, minor)
    pub product_version: (u16, u16),
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 7_000,
            handshake_timeout_ms: 10_000,
            close_ack_timeout_ms: 5_000,
            exchange_timeout_ms: None,
            max_transmission_size: 64 * 1024,
            max_message_size: 100 * 1024 * 1024, // 100 MiB
            chunk_threshold: crate::codec::MINIMUM_MESSAGE_SIZE_FOR_CHUNKING,
            product_id: crate::protocol::PRODUCT_ID_JETSTREAM,
            product_version: (9, 0),
        }
    }
}

impl ConnectionConfig {
    /// Heartbeat interval, `None` when disabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0)
            .then(|| Duration::from_millis(u64::from(self.heartbeat_interval_ms)))
    }

    /// Heartbeat response timeout
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.heartbeat_timeout_ms))
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Close acknowledgement timeout
    pub fn close_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.close_ack_timeout_ms)
    }

    /// Exchange timeout: explicit value, else heartbeat interval + timeout
    pub fn exchange_timeout(&self) -> Duration {
        match (self.exchange_timeout_ms, self.heartbeat_interval()) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(interval)) => interval + self.heartbeat_timeout(),
            (None, None) => Duration::from_secs(30),
        }
    }

    /// Disable heartbeats
    pub fn without_heartbeats(mut self) -> Self {
        self.heartbeat_interval_ms = 0;
        self
    }

    /// Set heartbeat interval and timeout
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u32;
        self.heartbeat_timeout_ms = timeout.as_millis() as u32;
        self
    }

    /// Set chunking threshold and per-frame payload size
    pub fn with_chunking(mut self, threshold: usize, max_transmission_size: u32) -> Self {
        self.chunk_threshold = threshold;
        self.max_transmission_size = max_transmission_size;
        self
    }

    /// Set close acknowledgement timeout
    pub fn with_close_ack_timeout(mut self, timeout: Duration) -> Self {
        self.close_ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set exchange timeout
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Capability overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Peer must bootstrap without Java-only facilities
    pub non_java_bootstrap: bool,

    /// Only JMS messages may be sent to us
    pub jms_messages_only: bool,

    /// Only JMF-encoded messages may be sent to us
    pub jmf_encoding_only: bool,

    /// Never use optimized transaction flows
    pub disable_optimized_tx: bool,
}

impl CapabilityConfig {
    /// Local capability mask: default mask adjusted by these overrides
    pub fn local_mask(&self) -> CapabilityMask {
        CapabilityMask::DEFAULT.with_overrides(self)
    }
}

/// FAP version overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Highest FAP level this side will negotiate
    pub max_fap_level: Option<u16>,
}

/// Read-ahead watermarks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadAheadConfig {
    /// Stop requesting more data once this many bytes are buffered
    pub high_queue_bytes: usize,

    /// Low watermark as a fraction of `high_queue_bytes`
    pub low_queue_bytes_factor: f64,

    /// Hard ceiling on a single refill request
    pub max_queue_bytes: usize,

    /// Force a refill when nothing arrives for this long, in milliseconds
    pub stall_timeout_ms: u64,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            high_queue_bytes: 574 * 1024,
            low_queue_bytes_factor: 0.5,
            max_queue_bytes: 5740 * 1024,
            stall_timeout_ms: 2_000,
        }
    }
}

impl ReadAheadConfig {
    /// Low watermark in bytes
    pub fn low_queue_bytes(&self) -> usize {
        (self.high_queue_bytes as f64 * self.low_queue_bytes_factor) as usize
    }

    /// Stall timeout
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Consumer callback dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Run consumer callbacks on the reader task
    pub inline_callbacks: bool,

    /// Worker count when callbacks are not inline
    pub worker_pool_size: usize,

    /// Bounded queue depth per worker
    pub worker_queue_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inline_callbacks: true,
            worker_pool_size: 10,
            worker_queue_depth: 64,
        }
    }
}

impl DispatchConfig {
    /// Dispatch mode selected by this configuration
    pub fn mode(&self) -> DispatchMode {
        if self.inline_callbacks {
            DispatchMode::Inline
        } else {
            DispatchMode::WorkerPool {
                workers: self.worker_pool_size,
                queue_depth: self.worker_queue_depth,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.chunk_threshold, 1_024_000);
        assert_eq!(config.read_ahead.low_queue_bytes(), 574 * 512);
        assert!(config.dispatch.inline_callbacks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exchange_timeout_derivation() {
        let config = ConnectionConfig::default();
        assert_eq!(config.exchange_timeout(), Duration::from_millis(12_000));

        let config = ConnectionConfig::default().without_heartbeats();
        assert_eq!(config.exchange_timeout(), Duration::from_secs(30));

        let config = ConnectionConfig::default().with_exchange_timeout(Duration::from_millis(50));
        assert_eq!(config.exchange_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [connection]
            heartbeat_interval_ms = 1000
            chunk_threshold = 4096

            [capabilities]
            disable_optimized_tx = true

            [versions]
            max_fap_level = 15

            [dispatch]
            inline_callbacks = false
            worker_pool_size = 4
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.connection.heartbeat_interval_ms, 1000);
        assert_eq!(config.connection.chunk_threshold, 4096);
        assert_eq!(config.connection.heartbeat_timeout_ms, 7_000);
        assert!(config.capabilities.disable_optimized_tx);
        assert_eq!(config.versions.max_fap_level, Some(15));
        assert_eq!(
            config.dispatch.mode(),
            DispatchMode::WorkerPool {
                workers: 4,
                queue_depth: 64
            }
        );
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[read_ahead]\nhigh_queue_bytes = 2048\nmax_queue_bytes = 8192\n")
            .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.read_ahead.high_queue_bytes, 2048);
        assert_eq!(config.read_ahead.low_queue_bytes(), 1024);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[read_ahead]\nlow_queue_bytes_factor = 1.5\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(JfapError::Config(_))));
    }

    #[test]
    fn test_merge_prefers_other() {
        let base = Config::default();
        let mut other = Config::default();
        other.connection.heartbeat_interval_ms = 250;
        other.versions.max_fap_level = Some(9);

        let merged = base.merge(other);
        assert_eq!(merged.connection.heartbeat_interval_ms, 250);
        assert_eq!(merged.versions.max_fap_level, Some(9));
    }
}
