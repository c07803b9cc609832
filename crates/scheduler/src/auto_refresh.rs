//! Periodic loop that detects rolled-over rate-limit windows and issues
//! synthetic warm-up requests through the proxy's own HTTP surface, so a
//! refresh token never goes stale purely from lack of client traffic.

use account_store::writer::{AsyncDbWriter, WriteJob};
use account_store::{Account, AccountStore};
use common::time::now_ms;
use provider::adapter::ProviderAdapter;
use proxy_core::types::{BYPASS_SESSION_HEADER, FORCE_ACCOUNT_HEADER};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use token_manager::HealthMonitor;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Default cycle interval.
pub const TICK: Duration = Duration::from_secs(60);
/// Consecutive warm-up failures before a loud "needs attention" log fires.
pub const FAILURE_THRESHOLD: u32 = 5;
const STALE_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Tunable knobs for the warm-up cycle cadence, threaded in from an
/// operator's `[tuning]` config table.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTuning {
    pub tick: Duration,
    pub failure_threshold: u32,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            tick: TICK,
            failure_threshold: FAILURE_THRESHOLD,
        }
    }
}
const USER_AGENT: &str = "claude-cli/2.0.76 (external, sdk-cli)";

/// Small models tried in order until one doesn't 404 — accounts for upstream
/// deployments that only expose a subset of the model catalog.
const WARM_UP_MODELS: &[&str] = &["claude-3-5-haiku-20241022", "claude-3-haiku-20240307"];

/// Innocuous prompts rotated across warm-up calls so request bodies aren't
/// byte-identical (some upstreams cache/dedup identical bodies).
const WARM_UP_PROMPTS: &[&str] = &["hi", "ping", "hello"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WarmUpOutcome {
    Refreshed,
    NeedsReauth,
    Failed,
}

pub struct AutoRefreshScheduler {
    store: AccountStore,
    writer: AsyncDbWriter,
    http: reqwest::Client,
    adapter: Arc<dyn ProviderAdapter>,
    base_url: String,
    health_monitor: Arc<HealthMonitor>,
    tuning: SchedulerTuning,
    cycle_lock: Mutex<()>,
    last_refreshed: Mutex<HashMap<String, u64>>,
    consecutive_failures: Mutex<HashMap<String, u32>>,
}

impl AutoRefreshScheduler {
    pub fn new(
        store: AccountStore,
        writer: AsyncDbWriter,
        http: reqwest::Client,
        adapter: Arc<dyn ProviderAdapter>,
        base_url: String,
        health_monitor: Arc<HealthMonitor>,
        tuning: SchedulerTuning,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            store,
            writer,
            http,
            adapter,
            base_url,
            health_monitor,
            tuning,
            cycle_lock: Mutex::new(()),
            last_refreshed: Mutex::new(HashMap::new()),
            consecutive_failures: Mutex::new(HashMap::new()),
        });
        scheduler.clone().spawn_driver();
        scheduler
    }

    fn spawn_driver(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.tuning.tick).await;
                self.run_cycle().await;
            }
        });
    }

    /// Run one cycle. A `try_lock` guards against overlapping cycles rather
    /// than queuing them — a cycle that's still running means the last one
    /// is slow, not that two should interleave writes to the same accounts.
    pub async fn run_cycle(&self) {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("auto-refresh cycle already running, skipping tick");
            return;
        };

        let accounts = match self.store.list_all().await {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(error = %common::redact::redact_error(&err), "auto-refresh cycle failed to list accounts");
                return;
            }
        };

        self.gc_tracking_maps(&accounts).await;

        let now = now_ms();
        let mut to_refresh = Vec::new();
        for account in &accounts {
            if !is_eligible(account, now) {
                continue;
            }
            let last = self.last_refreshed.lock().await.get(&account.id).copied();
            if should_refresh(account.rate_limit.reset_ms, last, now) {
                to_refresh.push(account.clone());
            }
        }

        for account in to_refresh {
            let outcome = self.send_warm_up(&account).await;
            self.record_outcome(&account.id, outcome).await;
        }

        // Account health (age bands, reauth requirements) can change as a
        // direct result of this cycle's warm-ups, so recompute out-of-band
        // rather than waiting for the next periodic poll.
        self.health_monitor.refresh().await;
    }

    async fn gc_tracking_maps(&self, accounts: &[Account]) {
        let keep: std::collections::HashSet<&str> = accounts
            .iter()
            .filter(|a| a.policy.auto_refresh_enabled)
            .map(|a| a.id.as_str())
            .collect();

        self.last_refreshed.lock().await.retain(|id, _| keep.contains(id.as_str()));
        self.consecutive_failures
            .lock()
            .await
            .retain(|id, _| keep.contains(id.as_str()));
    }

    async fn record_outcome(&self, account_id: &str, outcome: WarmUpOutcome) {
        match outcome {
            WarmUpOutcome::Refreshed => {
                self.consecutive_failures.lock().await.remove(account_id);
            }
            WarmUpOutcome::NeedsReauth => {
                self.consecutive_failures.lock().await.remove(account_id);
            }
            WarmUpOutcome::Failed => {
                let mut failures = self.consecutive_failures.lock().await;
                let count = failures.entry(account_id.to_string()).or_insert(0);
                *count += 1;
                if *count >= self.tuning.failure_threshold {
                    error!(account_id, consecutive_failures = *count, "auto-refresh needs attention");
                }
            }
        }
    }

    /// POST a trivial message through the proxy's own `/v1/messages`
    /// endpoint as this account, trying smaller models until one is
    /// actually served (a 404 means this deployment doesn't expose that
    /// model, not that the account is unhealthy).
    async fn send_warm_up(&self, account: &Account) -> WarmUpOutcome {
        let request_id = uuid::Uuid::new_v4().to_string();
        info!(account_id = %account.id, request_id = %request_id, "auto-refresh warm-up start");

        let url = format!("{}/v1/messages", self.base_url);
        let prompt = WARM_UP_PROMPTS[now_ms() as usize % WARM_UP_PROMPTS.len()];

        let mut response = None;
        for model in WARM_UP_MODELS {
            let body = serde_json::json!({
                "model": model,
                "max_tokens": 10,
                "messages": [{"role": "user", "content": prompt}],
            });

            let result = self
                .http
                .post(&url)
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .header(FORCE_ACCOUNT_HEADER, account.id.as_str())
                .header(BYPASS_SESSION_HEADER, "true")
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().as_u16() == 404 => continue,
                Ok(resp) => {
                    response = Some(resp);
                    break;
                }
                Err(err) => {
                    warn!(account_id = %account.id, error = %common::redact::redact_error(&err), "auto-refresh warm-up request failed");
                    return WarmUpOutcome::Failed;
                }
            }
        }

        let Some(response) = response else {
            warn!(account_id = %account.id, "auto-refresh warm-up exhausted model list with only 404s");
            return WarmUpOutcome::Failed;
        };

        self.handle_warm_up_response(account, response).await
    }

    async fn handle_warm_up_response(&self, account: &Account, response: reqwest::Response) -> WarmUpOutcome {
        let status = response.status();

        if status.as_u16() == 401 {
            error!(
                account_id = %account.id,
                "auto-refresh: account needs manual re-authentication, disabling auto-refresh"
            );
            self.writer
                .enqueue(WriteJob::SetAutoRefreshEnabled {
                    account_id: account.id.clone(),
                    enabled: false,
                })
                .await;
            return WarmUpOutcome::NeedsReauth;
        }

        if !status.is_success() {
            warn!(account_id = %account.id, status = status.as_u16(), "auto-refresh warm-up got non-success response");
            return WarmUpOutcome::Failed;
        }

        let headers = response.headers().clone();
        let rate_limit = self.adapter.parse_rate_limit(status.as_u16(), &headers);
        let tier = self.adapter.extract_tier_info(&headers);

        self.writer
            .enqueue(WriteJob::ClearRateLimitedIfExpired {
                account_id: account.id.clone(),
            })
            .await;
        self.writer
            .enqueue(WriteJob::UpdateRateLimitMeta {
                account_id: account.id.clone(),
                status: tier.clone(),
                reset_ms: rate_limit.reset_ms,
                remaining: None,
            })
            .await;
        if let Some(tier) = tier {
            self.writer
                .enqueue(WriteJob::UpdateTier {
                    account_id: account.id.clone(),
                    tier,
                })
                .await;
        }

        if let Some(reset_ms) = rate_limit.reset_ms {
            self.last_refreshed.lock().await.insert(account.id.clone(), reset_ms);
        }

        WarmUpOutcome::Refreshed
    }
}

fn is_eligible(account: &Account, now: u64) -> bool {
    if !account.policy.auto_refresh_enabled || account.provider != "anthropic" {
        return false;
    }
    match account.rate_limit.reset_ms {
        None => true,
        Some(reset_ms) => reset_ms <= now || reset_ms < now.saturating_sub(STALE_WINDOW_MS),
    }
}

/// Decide whether an eligible account's window should actually be refreshed
/// this cycle, given the remembered last-refreshed reset marker.
fn should_refresh(reset_ms: Option<u64>, last_refreshed: Option<u64>, now: u64) -> bool {
    let Some(last) = last_refreshed else {
        return true;
    };
    let Some(reset_ms) = reset_ms else {
        return false;
    };
    if reset_ms <= now {
        return true;
    }
    if reset_ms > last {
        return true;
    }
    reset_ms < now.saturating_sub(STALE_WINDOW_MS)
}
