// src/config.rs

//! Configuration loading and the tunables handed to the monitor subsystems.
//!
//! All thresholds live in explicit structs passed to the engines at
//! construction time, never in process-wide globals, so several independent
//! monitor instances can run (and be tested) in the same process.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

/// One WAL segment. The default threshold for both enabling synchronous
/// replication and accepting a promotion.
const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub health: HealthCheckConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            timing: TimingConfig::default(),
            health: HealthCheckConfig::default(),
        }
    }
}

/// Thresholds and timeouts driving the group state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// WAL distance under which a catching-up standby is close enough to
    /// re-enable synchronous replication.
    #[serde(default = "default_wal_threshold")]
    pub enable_sync_wal_threshold: u64,

    /// WAL distance above which promoting a standby would lose more data
    /// than accepted, and the failover is refused.
    #[serde(default = "default_wal_threshold")]
    pub promote_wal_threshold: u64,

    /// Grace window a demoted primary gets to notice it should stop itself
    /// before being presumed dead.
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,

    /// A node that has not reported for longer than this, with a failing
    /// background check, is considered unhealthy.
    #[serde(with = "humantime_serde", default = "default_unhealthy_timeout")]
    pub unhealthy_timeout: Duration,

    /// No node is marked unhealthy on timing grounds alone before the
    /// monitor has been up this long, to avoid false failovers right after
    /// a restart.
    #[serde(with = "humantime_serde", default = "default_startup_grace_period")]
    pub startup_grace_period: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            enable_sync_wal_threshold: default_wal_threshold(),
            promote_wal_threshold: default_wal_threshold(),
            drain_timeout: default_drain_timeout(),
            unhealthy_timeout: default_unhealthy_timeout(),
            startup_grace_period: default_startup_grace_period(),
        }
    }
}

/// Tunables of the background health-check engine.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// How often every known node is probed.
    #[serde(with = "humantime_serde", default = "default_health_period")]
    pub period: Duration,

    /// Bounded connect timeout for a single probe attempt.
    #[serde(with = "humantime_serde", default = "default_health_connect_timeout")]
    pub connect_timeout: Duration,

    /// How many times a failed probe is retried before the node is marked
    /// unreachable for the round.
    #[serde(default = "default_health_max_retries")]
    pub max_retries: u32,

    /// Delay between two probe attempts against the same node.
    #[serde(with = "humantime_serde", default = "default_health_retry_delay")]
    pub retry_delay: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            period: default_health_period(),
            connect_timeout: default_health_connect_timeout(),
            max_retries: default_health_max_retries(),
            retry_delay: default_health_retry_delay(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_wal_threshold() -> u64 {
    DEFAULT_WAL_SEGMENT_SIZE
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_unhealthy_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_startup_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_health_period() -> Duration {
    Duration::from_secs(5)
}

fn default_health_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_max_retries() -> u32 {
    2
}

fn default_health_retry_delay() -> Duration {
    Duration::from_secs(2)
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
