//! Credential resolution (OAuth refresh with dedup and backoff) and
//! long-lived-credential health classification.

pub mod error;
pub mod health;
pub mod manager;

pub use error::{Error, Result};
pub use health::{classify_account, compute_report, HealthMonitor, HealthThresholds, POLL_INTERVAL};
pub use manager::{
    RefreshTuning, TokenManager, BACKOFF_MS, FAILURE_MAP_CAP, FAILURE_TTL, MAX_BACKOFF_RETRIES, SAFETY_WINDOW_MS,
};
