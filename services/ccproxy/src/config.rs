//! Configuration types and loading.
//!
//! A single TOML file drives every tunable named across the proxy's
//! modules: token-manager backoff/safety windows, the health monitor's age
//! bands, the post-processor's streaming buffer and orphan sweep, and the
//! scheduler's tick/failure threshold. Every field has a default matching
//! the constant the owning module would use if unconfigured, so an empty
//! `[tuning]` table (or an absent one) reproduces the hardcoded behavior.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8787".parse().unwrap()
}

fn default_admin_listen_addr() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("ccproxy.sqlite3")
}

fn default_safety_window_ms() -> u64 {
    token_manager::SAFETY_WINDOW_MS
}

fn default_backoff_ms() -> u64 {
    token_manager::BACKOFF_MS
}

fn default_max_backoff_retries() -> u32 {
    token_manager::MAX_BACKOFF_RETRIES
}

fn default_failure_ttl_ms() -> u64 {
    token_manager::FAILURE_TTL.as_millis() as u64
}

fn default_max_failure_records() -> usize {
    token_manager::FAILURE_MAP_CAP
}

fn default_health_check_interval_ms() -> u64 {
    token_manager::POLL_INTERVAL.as_millis() as u64
}

fn default_refresh_token_warning_days() -> u64 {
    7
}

fn default_refresh_token_critical_days() -> u64 {
    3
}

fn default_refresh_token_max_age_days() -> u64 {
    90
}

fn default_stream_usage_buffer_bytes() -> usize {
    64 * 1024
}

fn default_stream_orphan_timeout_ms() -> u64 {
    30_000
}

fn default_scheduler_tick_secs() -> u64 {
    scheduler::TICK.as_secs()
}

fn default_failure_threshold() -> u32 {
    scheduler::FAILURE_THRESHOLD
}

/// Root configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
}

/// HTTP listener settings for the public proxy port and the admin port.
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_listen_addr")]
    pub admin_listen_addr: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_listen_addr: default_admin_listen_addr(),
        }
    }
}

/// Sqlite database location.
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Every numeric knob the dispatch/refresh/health/scheduler modules expose.
#[derive(Debug, Deserialize)]
pub struct TuningConfig {
    #[serde(default = "default_safety_window_ms")]
    pub safety_window_ms: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_retries")]
    pub max_backoff_retries: u32,
    #[serde(default = "default_failure_ttl_ms")]
    pub failure_ttl_ms: u64,
    #[serde(default = "default_max_failure_records")]
    pub max_failure_records: usize,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_refresh_token_warning_days")]
    pub refresh_token_warning_days: u64,
    #[serde(default = "default_refresh_token_critical_days")]
    pub refresh_token_critical_days: u64,
    #[serde(default = "default_refresh_token_max_age_days")]
    pub refresh_token_max_age_days: u64,
    #[serde(default = "default_stream_usage_buffer_bytes")]
    pub stream_usage_buffer_bytes: usize,
    #[serde(default = "default_stream_orphan_timeout_ms")]
    pub stream_orphan_timeout_ms: u64,
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            safety_window_ms: default_safety_window_ms(),
            backoff_ms: default_backoff_ms(),
            max_backoff_retries: default_max_backoff_retries(),
            failure_ttl_ms: default_failure_ttl_ms(),
            max_failure_records: default_max_failure_records(),
            health_check_interval_ms: default_health_check_interval_ms(),
            refresh_token_warning_days: default_refresh_token_warning_days(),
            refresh_token_critical_days: default_refresh_token_critical_days(),
            refresh_token_max_age_days: default_refresh_token_max_age_days(),
            stream_usage_buffer_bytes: default_stream_usage_buffer_bytes(),
            stream_orphan_timeout_ms: default_stream_orphan_timeout_ms(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            database: DatabaseConfig::default(),
            tuning: TuningConfig::default(),
        }
    }
}

impl Config {
    /// Resolve the config path from `--config`, then `CCPROXY_CONFIG`, then
    /// the default filename in the current directory.
    pub fn resolve_path(cli_value: Option<&str>) -> PathBuf {
        common::config::resolve_path(cli_value, "CCPROXY_CONFIG", "ccproxy.toml")
    }

    /// Load configuration from a TOML file. A missing file is not an error —
    /// the service runs on defaults, same as every `#[serde(default)]` field
    /// above implies.
    pub fn load(path: &PathBuf) -> common::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        common::config::load_toml(path)
    }
}
