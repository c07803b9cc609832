//! A single-consumer write queue in front of [`AccountStore`].
//!
//! The dispatcher and post-processor call [`AsyncDbWriter::enqueue`] from
//! hot request paths and never await the database directly; a background
//! task drains the queue and applies writes to sqlite one at a time, the
//! same way the credential store serializes its file writes behind one
//! mutex. Overflow drops the oldest pending job rather than applying
//! backpressure to request handling — a stale usage update is harmless, a
//! stalled request handler is not.

use crate::store::AccountStore;
use crate::types::RequestUsage;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

/// Default depth of the pending-write queue before oldest jobs are dropped.
pub const DEFAULT_QUEUE_DEPTH: usize = 2048;

#[derive(Debug, Clone)]
pub enum WriteJob {
    UpdateUsage {
        account_id: String,
    },
    UpdateSessionSafe {
        account_id: String,
        bypass_session: bool,
    },
    MarkRateLimited {
        account_id: String,
        until_ms: u64,
    },
    ClearRateLimitedIfExpired {
        account_id: String,
    },
    UpdateRateLimitMeta {
        account_id: String,
        status: Option<String>,
        reset_ms: Option<u64>,
        remaining: Option<u64>,
    },
    UpdateTier {
        account_id: String,
        tier: String,
    },
    SetAutoRefreshEnabled {
        account_id: String,
        enabled: bool,
    },
    UpdateTokens {
        account_id: String,
        access_token: String,
        expires_at_ms: u64,
        refresh_token: Option<String>,
    },
    InsertRequestStart {
        request_id: String,
        account_id: Option<String>,
        method: String,
        path: String,
        timestamp_ms: u64,
    },
    UpdateRequestUsage {
        request_id: String,
        usage: RequestUsage,
    },
    FinalizeRequest {
        record: crate::types::RequestRecord,
    },
    PersistPayload {
        request_id: String,
        request_payload: Option<Vec<u8>>,
        response_payload: Option<Vec<u8>>,
    },
}

struct Queue {
    jobs: Mutex<VecDeque<WriteJob>>,
    notify: Notify,
    max_depth: usize,
}

/// Handle to the background writer task. Dropping every clone of the
/// returned handle does not stop the task; call [`AsyncDbWriter::shutdown`]
/// to drain and stop it deterministically (used by tests and graceful
/// shutdown).
#[derive(Clone)]
pub struct AsyncDbWriter {
    queue: Arc<Queue>,
    task: Arc<JoinHandle<()>>,
}

impl AsyncDbWriter {
    pub fn spawn(store: AccountStore) -> Self {
        Self::spawn_with_depth(store, DEFAULT_QUEUE_DEPTH)
    }

    pub fn spawn_with_depth(store: AccountStore, max_depth: usize) -> Self {
        let queue = Arc::new(Queue {
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_depth,
        });

        let worker_queue = queue.clone();
        let task = tokio::spawn(async move {
            run_writer(worker_queue, store).await;
        });

        Self {
            queue,
            task: Arc::new(task),
        }
    }

    /// Enqueue a job for the background writer. Never blocks; on overflow
    /// the oldest pending job is dropped and logged.
    pub async fn enqueue(&self, job: WriteJob) {
        let mut jobs = self.queue.jobs.lock().await;
        if jobs.len() >= self.queue.max_depth {
            if let Some(dropped) = jobs.pop_front() {
                warn!(job = ?dropped, "write queue overflow, dropping oldest job");
            }
        }
        jobs.push_back(job);
        drop(jobs);
        self.queue.notify.notify_one();
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.jobs.lock().await.len()
    }

    /// Abort the background task. Intended for test teardown and process
    /// shutdown; pending jobs are discarded.
    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn run_writer(queue: Arc<Queue>, store: AccountStore) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock().await;
            jobs.pop_front()
        };

        let job = match job {
            Some(job) => job,
            None => {
                queue.notify.notified().await;
                continue;
            }
        };

        if let Err(err) = apply(&store, job).await {
            warn!(error = %err, "write queue job failed");
        }
    }
}

async fn apply(store: &AccountStore, job: WriteJob) -> crate::Result<()> {
    match job {
        WriteJob::UpdateUsage { account_id } => store.update_usage(&account_id).await,
        WriteJob::UpdateSessionSafe {
            account_id,
            bypass_session,
        } => store.update_session_safe(&account_id, bypass_session).await,
        WriteJob::MarkRateLimited { account_id, until_ms } => {
            store.mark_rate_limited(&account_id, until_ms).await
        }
        WriteJob::ClearRateLimitedIfExpired { account_id } => {
            store.clear_rate_limited_if_expired(&account_id).await
        }
        WriteJob::UpdateRateLimitMeta {
            account_id,
            status,
            reset_ms,
            remaining,
        } => {
            store
                .update_rate_limit_meta(&account_id, status.as_deref(), reset_ms, remaining)
                .await
        }
        WriteJob::UpdateTier { account_id, tier } => store.update_tier(&account_id, &tier).await,
        WriteJob::SetAutoRefreshEnabled { account_id, enabled } => {
            store.set_auto_refresh_enabled(&account_id, enabled).await
        }
        WriteJob::UpdateTokens {
            account_id,
            access_token,
            expires_at_ms,
            refresh_token,
        } => {
            store
                .update_tokens(&account_id, &access_token, expires_at_ms, refresh_token.as_deref())
                .await
        }
        WriteJob::InsertRequestStart {
            request_id,
            account_id,
            method,
            path,
            timestamp_ms,
        } => {
            store
                .insert_request_start(&request_id, account_id.as_deref(), &method, &path, timestamp_ms)
                .await
        }
        WriteJob::UpdateRequestUsage { request_id, usage } => {
            store.update_request_usage(&request_id, &usage).await
        }
        WriteJob::FinalizeRequest { record } => store.finalize_request(&record).await,
        WriteJob::PersistPayload {
            request_id,
            request_payload,
            response_payload,
        } => {
            store
                .persist_payload(
                    &request_id,
                    request_payload.as_deref(),
                    response_payload.as_deref(),
                )
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::time::now_ms;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn test_store() -> AccountStore {
        AccountStore::connect_in_memory().await.unwrap()
    }

    fn account(id: &str) -> crate::types::Account {
        crate::types::Account {
            id: id.to_string(),
            name: id.to_string(),
            provider: "anthropic".into(),
            credential: crate::types::Credential::OAuth {
                refresh_token: "rt".into(),
                access_token: Some("at".into()),
                expires_at_ms: Some(now_ms() + 1_000_000),
            },
            created_at_ms: Some(now_ms()),
            usage: crate::types::Usage::default(),
            rate_limit: crate::types::RateLimit::default(),
            policy: crate::types::Policy::default(),
        }
    }

    #[tokio::test]
    async fn enqueued_job_eventually_applies() {
        let store = test_store().await;
        store.insert_account(&account("acct-1")).await.unwrap();
        let writer = AsyncDbWriter::spawn(store.clone());

        writer
            .enqueue(WriteJob::UpdateUsage {
                account_id: "acct-1".into(),
            })
            .await;

        for _ in 0..50 {
            let found = store.find_by_id("acct-1").await.unwrap().unwrap();
            if found.usage.request_count == 1 {
                writer.abort();
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        writer.abort();
        panic!("write job never applied");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_without_panicking() {
        let store = test_store().await;
        store.insert_account(&account("acct-1")).await.unwrap();
        let writer = AsyncDbWriter::spawn_with_depth(store.clone(), 2);

        {
            let mut jobs = writer.queue.jobs.lock().await;
            jobs.push_back(WriteJob::UpdateUsage {
                account_id: "acct-1".into(),
            });
            jobs.push_back(WriteJob::UpdateUsage {
                account_id: "acct-1".into(),
            });
        }

        writer
            .enqueue(WriteJob::MarkRateLimited {
                account_id: "acct-1".into(),
                until_ms: now_ms() + 1000,
            })
            .await;

        assert!(writer.queue_len().await <= 2);
        writer.abort();
    }

    #[tokio::test]
    async fn queue_len_reflects_pending_jobs_before_drain() {
        let store = test_store().await;
        store.insert_account(&account("acct-1")).await.unwrap();
        let writer = AsyncDbWriter::spawn(store.clone());
        writer.abort();

        writer
            .enqueue(WriteJob::UpdateUsage {
                account_id: "acct-1".into(),
            })
            .await;
        assert_eq!(writer.queue_len().await, 1);
    }
}
