//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ballast_store::S3Config;

use crate::BLOCK_SIZE;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Block size other than the fixed persistence unit
    #[error("block size must be {BLOCK_SIZE} bytes, got {0}")]
    BlockSize(u64),

    /// Zero-sized export
    #[error("export size must be non-zero")]
    ZeroExportSize,

    /// Flush fan-out of zero would deadlock the upload path
    #[error("flush parallelism must be at least 1")]
    ZeroFlushParallelism,

    /// Heartbeat must fire well inside the lease lifetime
    #[error("heartbeat interval ({heartbeat}s) must be shorter than the lease ttl ({ttl}s)")]
    HeartbeatTooLong {
        /// Configured heartbeat interval in seconds
        heartbeat: u64,
        /// Configured lease ttl in seconds
        ttl: u64,
    },
}

/// TCP keepalive settings applied to every accepted connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Seconds of idle time before the first probe
    pub idle_secs: u64,
    /// Seconds between probes
    pub interval_secs: u64,
    /// Failed probes before the connection is declared dead
    pub probes: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            interval_secs: 10,
            probes: 6,
        }
    }
}

/// NBD server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Size of every export in bytes
    pub export_size: u64,
    /// Persistence block size; must equal [`BLOCK_SIZE`]
    pub block_size: u64,
    /// Object store connection settings
    pub s3: S3Config,
    /// Lease lifetime in seconds
    pub lease_ttl_secs: u64,
    /// Lease renewal interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Maximum concurrent block uploads per flush
    pub flush_parallelism: usize,
    /// Keepalive applied to accepted sockets
    pub keepalive: KeepaliveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10809,
            export_size: 1024 * 1024 * 1024, // 1 GiB
            block_size: BLOCK_SIZE,
            s3: S3Config::default(),
            lease_ttl_secs: 30,
            heartbeat_interval_secs: 15,
            flush_parallelism: 10,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bind host and port.
    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set export size.
    pub fn export_size(mut self, size: u64) -> Self {
        self.export_size = size;
        self
    }

    /// Set object store settings.
    pub fn s3(mut self, s3: S3Config) -> Self {
        self.s3 = s3;
        self
    }

    /// Set lease ttl and heartbeat interval.
    pub fn lease(mut self, ttl_secs: u64, heartbeat_secs: u64) -> Self {
        self.lease_ttl_secs = ttl_secs;
        self.heartbeat_interval_secs = heartbeat_secs;
        self
    }

    /// Set the flush upload fan-out.
    pub fn flush_parallelism(mut self, parallelism: usize) -> Self {
        self.flush_parallelism = parallelism;
        self
    }

    /// Address string the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Lease lifetime as a duration.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Check the invariants the rest of the stack assumes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size != BLOCK_SIZE {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if self.export_size == 0 {
            return Err(ConfigError::ZeroExportSize);
        }
        if self.flush_parallelism == 0 {
            return Err(ConfigError::ZeroFlushParallelism);
        }
        if self.heartbeat_interval_secs >= self.lease_ttl_secs {
            return Err(ConfigError::HeartbeatTooLong {
                heartbeat: self.heartbeat_interval_secs,
                ttl: self.lease_ttl_secs,
            });
        }
        Ok(())
    }
}
