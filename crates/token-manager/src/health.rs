//! Classifies each account's long-lived credential into a health band and
//! retains the most recent report for serving.

use account_store::{Account, AccountHealth, Credential, HealthReport, HealthStatus, HealthSummary};
use common::time::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
/// Interval between background health re-classification sweeps.
pub const POLL_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Day-based thresholds for credential-age classification, threaded in from
/// an operator's `[tuning]` config table. The 60-day advisory-warning band
/// is not independently configurable; it only ever fires inside the window
/// between `warning_days` and `max_age_days`.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub poll_interval: Duration,
    pub warning_days: i64,
    pub critical_days: i64,
    pub max_age_days: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            warning_days: 7,
            critical_days: 3,
            max_age_days: 90,
        }
    }
}

/// Classify a single account's credential age into a health band.
pub fn classify_account(account: &Account, thresholds: &HealthThresholds) -> AccountHealth {
    let id = account.id.clone();

    let has_refresh_token = match &account.credential {
        Credential::ApiKey { .. } => false,
        Credential::OAuth { refresh_token, .. } => !refresh_token.is_empty(),
    };

    if !has_refresh_token {
        return AccountHealth {
            account_id: id,
            status: HealthStatus::NoRefreshToken,
            age_days: None,
            days_until_expiration: None,
            requires_reauth: !account.credential.is_api_key(),
            message: if account.credential.is_api_key() {
                "api key account, no oauth re-authentication required".into()
            } else {
                "oauth account has no refresh token".into()
            },
        };
    }

    let Some(created_at_ms) = account.created_at_ms else {
        return AccountHealth {
            account_id: id,
            status: HealthStatus::Warning,
            age_days: None,
            days_until_expiration: None,
            requires_reauth: true,
            message: "credential age unknown, missing creation timestamp".into(),
        };
    };

    let now = now_ms();
    let age_ms = now.saturating_sub(created_at_ms);
    let age_days = (age_ms / DAY_MS) as i64;
    let max_age_ms = thresholds.max_age_days as u64 * DAY_MS;
    let remaining_ms = (created_at_ms + max_age_ms).saturating_sub(now) as i64;
    let days_until_expiration = div_ceil_i64(remaining_ms, DAY_MS as i64);

    let (status, requires_reauth, message) = if days_until_expiration <= 0 {
        (
            HealthStatus::Expired,
            true,
            "refresh token has exceeded its maximum age".to_string(),
        )
    } else if days_until_expiration <= thresholds.critical_days {
        (
            HealthStatus::Critical,
            true,
            format!("refresh token expires in {days_until_expiration} day(s)"),
        )
    } else if days_until_expiration <= thresholds.warning_days {
        (
            HealthStatus::Warning,
            false,
            format!("refresh token expires in {days_until_expiration} day(s)"),
        )
    } else if age_days > 60 {
        (
            HealthStatus::Warning,
            false,
            format!("refresh token is {age_days} day(s) old"),
        )
    } else {
        (HealthStatus::Healthy, false, "healthy".to_string())
    };

    AccountHealth {
        account_id: id,
        status,
        age_days: Some(age_days),
        days_until_expiration: Some(days_until_expiration),
        requires_reauth,
        message,
    }
}

fn div_ceil_i64(numerator: i64, denominator: i64) -> i64 {
    if numerator <= 0 {
        return numerator / denominator;
    }
    (numerator + denominator - 1) / denominator
}

/// Compute a full report across all accounts.
pub fn compute_report(accounts: &[Account], thresholds: &HealthThresholds) -> HealthReport {
    let mut summary = HealthSummary::default();
    let per_account: Vec<AccountHealth> = accounts
        .iter()
        .map(|account| {
            let health = classify_account(account, thresholds);
            summary.total += 1;
            match health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Warning => summary.warning += 1,
                HealthStatus::Critical => summary.critical += 1,
                HealthStatus::Expired => summary.expired += 1,
                HealthStatus::NoRefreshToken => summary.no_refresh_token += 1,
            }
            if health.requires_reauth {
                summary.requires_reauth += 1;
            }
            health
        })
        .collect();

    HealthReport {
        generated_at_ms: now_ms(),
        per_account,
        summary,
    }
}

/// Periodic driver holding the last computed report in memory.
pub struct HealthMonitor {
    store: account_store::AccountStore,
    last_report: RwLock<Option<HealthReport>>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(store: account_store::AccountStore, thresholds: HealthThresholds) -> Arc<Self> {
        let monitor = Arc::new(Self {
            store,
            last_report: RwLock::new(None),
            thresholds,
        });
        monitor.clone().spawn_driver();
        monitor
    }

    fn spawn_driver(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                self.refresh().await;
                tokio::time::sleep(self.thresholds.poll_interval).await;
            }
        });
    }

    /// Recompute the report immediately. Called on the periodic schedule
    /// and after each scheduler cycle.
    pub async fn refresh(&self) {
        match self.store.list_all().await {
            Ok(accounts) => {
                let report = compute_report(&accounts, &self.thresholds);
                debug!(
                    total = report.summary.total,
                    requires_reauth = report.summary.requires_reauth,
                    "health report updated"
                );
                *self.last_report.write().await = Some(report);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to list accounts for health report");
            }
        }
    }

    pub async fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().await.clone()
    }
}
