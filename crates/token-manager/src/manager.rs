//! Resolves a valid access credential for an account, deduplicating
//! concurrent refreshes and backing off after repeated failures.

use crate::error::{Error, Result};
use account_store::{Account, AccountStore, Credential};
use account_store::writer::{AsyncDbWriter, WriteJob};
use common::time::now_ms;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// An access token must have at least this much headroom before it is
/// reused without refreshing.
pub const SAFETY_WINDOW_MS: u64 = 30 * 60 * 1000;
/// Minimum time between refresh attempts for an account that just failed.
pub const BACKOFF_MS: u64 = 60_000;
/// Every this-many backoff-gated attempts, reload the account from the
/// store in case another process instance already refreshed it.
pub const MAX_BACKOFF_RETRIES: u32 = 10;
/// Failure records older than this are evicted by the janitor.
pub const FAILURE_TTL: Duration = Duration::from_secs(5 * 60);
/// Upper bound on the failure map, enforced as an LRU via insertion order.
pub const FAILURE_MAP_CAP: usize = 1000;

/// Tunable knobs for refresh dedup/backoff, threaded through from an
/// operator's `[tuning]` config table. Defaults match the module constants.
#[derive(Debug, Clone, Copy)]
pub struct RefreshTuning {
    pub safety_window_ms: u64,
    pub backoff_ms: u64,
    pub max_backoff_retries: u32,
    pub failure_ttl: Duration,
    pub failure_map_cap: usize,
}

impl Default for RefreshTuning {
    fn default() -> Self {
        Self {
            safety_window_ms: SAFETY_WINDOW_MS,
            backoff_ms: BACKOFF_MS,
            max_backoff_retries: MAX_BACKOFF_RETRIES,
            failure_ttl: FAILURE_TTL,
            failure_map_cap: FAILURE_MAP_CAP,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureEntry {
    last_failure_ms: u64,
    attempts: u32,
}

struct FailureMap {
    entries: HashMap<String, FailureEntry>,
    order: std::collections::VecDeque<String>,
    cap: usize,
    ttl_ms: u64,
}

impl FailureMap {
    fn new(cap: usize, ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: std::collections::VecDeque::new(),
            cap,
            ttl_ms,
        }
    }

    fn record(&mut self, account_id: &str) -> u32 {
        let attempts = self
            .entries
            .get(account_id)
            .map(|e| e.attempts + 1)
            .unwrap_or(1);

        if !self.entries.contains_key(account_id) {
            self.order.push_back(account_id.to_string());
            while self.entries.len() >= self.cap {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }

        self.entries.insert(
            account_id.to_string(),
            FailureEntry {
                last_failure_ms: now_ms(),
                attempts,
            },
        );
        attempts
    }

    fn get(&self, account_id: &str) -> Option<FailureEntry> {
        self.entries.get(account_id).copied()
    }

    fn clear(&mut self, account_id: &str) {
        self.entries.remove(account_id);
    }

    fn sweep(&mut self, now: u64) {
        let ttl_ms = self.ttl_ms;
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_failure_ms) > ttl_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        self.order.retain(|id| self.entries.contains_key(id));
    }
}

/// Returns a valid access credential for an account, handling OAuth refresh,
/// refresh deduplication, and failure backoff.
pub struct TokenManager {
    store: AccountStore,
    writer: AsyncDbWriter,
    http: reqwest::Client,
    accounts: RwLock<HashMap<String, Account>>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    failures: Mutex<FailureMap>,
    tuning: RefreshTuning,
}

impl TokenManager {
    pub fn new(store: AccountStore, writer: AsyncDbWriter, http: reqwest::Client, tuning: RefreshTuning) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            writer,
            http,
            accounts: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            failures: Mutex::new(FailureMap::new(tuning.failure_map_cap, tuning.failure_ttl.as_millis() as u64)),
            tuning,
        });
        manager.clone().spawn_janitor();
        manager
    }

    fn spawn_janitor(self: Arc<Self>) {
        tokio::spawn(async move {
            let period = self.tuning.failure_ttl / 10;
            loop {
                tokio::time::sleep(period).await;
                let mut failures = self.failures.lock().await;
                failures.sweep(now_ms());
            }
        });
    }

    /// Load (or refresh the cached copy of) an account's in-memory state.
    pub async fn hydrate(&self, account: Account) {
        self.accounts.write().await.insert(account.id.clone(), account);
    }

    async fn cached(&self, account_id: &str) -> Option<Account> {
        self.accounts.read().await.get(account_id).cloned()
    }

    /// Resolve the bearer/API-key value to place in the request's auth
    /// header for `account_id`. The caller must have hydrated the account
    /// at least once via [`TokenManager::hydrate`] or a prior call to this
    /// method, which lazily loads from the store on a cache miss.
    pub async fn get_valid_access_token(&self, account_id: &str) -> Result<String> {
        let account = match self.cached(account_id).await {
            Some(account) => account,
            None => {
                let loaded = self
                    .store
                    .find_by_id(account_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
                self.hydrate(loaded.clone()).await;
                loaded
            }
        };

        match &account.credential {
            Credential::ApiKey { secret } => Ok(secret.clone()),
            Credential::OAuth {
                access_token,
                expires_at_ms,
                ..
            } => {
                if let (Some(token), Some(expires_at)) = (access_token, expires_at_ms) {
                    if expires_at.saturating_sub(now_ms()) > self.tuning.safety_window_ms {
                        return Ok(token.clone());
                    }
                }
                self.refresh_safe(account_id).await
            }
        }
    }

    async fn refresh_lock_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns `Some(result)` if `account_id` is within its backoff window
    /// and the caller must not proceed to `do_refresh`, `None` otherwise.
    async fn backoff_gate(&self, account_id: &str) -> Option<Result<String>> {
        let entry = self.failures.lock().await.get(account_id)?;
        let since_failure = now_ms().saturating_sub(entry.last_failure_ms);
        if since_failure >= self.tuning.backoff_ms {
            return None;
        }
        if entry.attempts % self.tuning.max_backoff_retries == 0 {
            return Some(self.recover_from_store(account_id).await);
        }
        Some(Err(Error::Unavailable(format!(
            "account {account_id} in refresh backoff"
        ))))
    }

    async fn refresh_safe(&self, account_id: &str) -> Result<String> {
        if let Some(result) = self.backoff_gate(account_id).await {
            return result;
        }

        let lock = self.refresh_lock_for(account_id).await;
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another caller may have just
        // completed the refresh this one would have performed, or recorded
        // the failure that put this account into backoff.
        if let Some(account) = self.cached(account_id).await {
            if let Credential::OAuth {
                access_token: Some(token),
                expires_at_ms: Some(expires_at),
                ..
            } = &account.credential
            {
                if expires_at.saturating_sub(now_ms()) > self.tuning.safety_window_ms {
                    return Ok(token.clone());
                }
            }
        }
        if let Some(result) = self.backoff_gate(account_id).await {
            return result;
        }

        self.do_refresh(account_id).await
    }

    async fn recover_from_store(&self, account_id: &str) -> Result<String> {
        let stored = self
            .store
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;

        if let Credential::OAuth {
            access_token: Some(token),
            expires_at_ms: Some(expires_at),
            ..
        } = &stored.credential
        {
            if *expires_at > now_ms() {
                info!(account_id, "recovered fresh token from store during backoff");
                self.hydrate(stored).await;
                self.failures.lock().await.clear(account_id);
                return Ok(token.clone());
            }
        }

        Err(Error::Unavailable(format!(
            "account {account_id} refresh unavailable and store copy is stale"
        )))
    }

    async fn do_refresh(&self, account_id: &str) -> Result<String> {
        let account = self
            .cached(account_id)
            .await
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;

        let refresh_token = match &account.credential {
            Credential::OAuth { refresh_token, .. } => refresh_token.clone(),
            Credential::ApiKey { secret } => return Ok(secret.clone()),
        };

        let result = anthropic_auth::token::refresh_token(&self.http, &refresh_token).await;

        match result {
            Ok(response) => {
                let expires_at_ms = now_ms() + response.expires_in * 1000;
                let rotated = (response.refresh_token != refresh_token)
                    .then_some(response.refresh_token.clone());

                {
                    let mut accounts = self.accounts.write().await;
                    if let Some(entry) = accounts.get_mut(account_id) {
                        entry.credential = Credential::OAuth {
                            refresh_token: rotated.clone().unwrap_or(refresh_token),
                            access_token: Some(response.access_token.clone()),
                            expires_at_ms: Some(expires_at_ms),
                        };
                        entry.usage.last_used_ms = Some(now_ms());
                    }
                }

                self.writer
                    .enqueue(WriteJob::UpdateTokens {
                        account_id: account_id.to_string(),
                        access_token: response.access_token.clone(),
                        expires_at_ms,
                        refresh_token: rotated,
                    })
                    .await;

                self.failures.lock().await.clear(account_id);
                debug!(account_id, "refreshed access token");
                Ok(response.access_token)
            }
            Err(err) => {
                let attempts = self.failures.lock().await.record(account_id);
                warn!(account_id, attempts, error = %common::redact::redact_error(&err), "token refresh failed");
                Err(Error::Refresh(err.to_string()))
            }
        }
    }
}
