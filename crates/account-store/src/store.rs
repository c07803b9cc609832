//! SQLite-backed implementation of the account store.
//!
//! All mutators return as soon as the in-process change is durable; heavy
//! or non-critical writes (request summaries, tier updates) are expected to
//! be enqueued on `AsyncDbWriter` by the caller rather than awaited inline —
//! this module itself stays a thin, synchronous-per-call SQL layer so it can
//! be driven either directly or from behind the writer queue.

use crate::error::{Error, Result};
use crate::types::{Account, Credential, Policy, RateLimit, RequestRecord, RequestUsage, Usage};
use common::time::now_ms;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Handle to the accounts/oauth_sessions/requests database.
#[derive(Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    /// Open (creating if needed) the sqlite database at `path` and run
    /// migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(Error::Database)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(Error::Database)?;

        MIGRATOR.run(&pool).await.map_err(Error::Migration)?;
        info!(path = %path.display(), "account store ready");

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(Error::Database)?;
        MIGRATOR.run(&pool).await.map_err(Error::Migration)?;
        Ok(Self { pool })
    }

    pub async fn insert_account(&self, account: &Account) -> Result<()> {
        let (credential_type, refresh_token, access_token, expires_at, api_key) =
            credential_columns(&account.credential);
        let model_mappings = account
            .policy
            .model_mappings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO accounts (
                id, name, provider, credential_type, refresh_token, access_token, expires_at,
                api_key, created_at, request_count, total_requests, last_used, session_start,
                session_request_count, rate_limit_reset, rate_limit_status, rate_limit_remaining,
                rate_limited_until, paused, priority, auto_fallback_enabled, auto_refresh_enabled,
                custom_endpoint, model_mappings
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(&account.name)
        .bind(&account.provider)
        .bind(credential_type)
        .bind(refresh_token)
        .bind(access_token)
        .bind(account.credential_expires_at_i64())
        .bind(api_key)
        .bind(account.created_at_ms.map(|v| v as i64))
        .bind(account.usage.request_count as i64)
        .bind(account.usage.total_requests as i64)
        .bind(account.usage.last_used_ms.map(|v| v as i64))
        .bind(account.usage.session_start_ms.map(|v| v as i64))
        .bind(account.usage.session_request_count as i64)
        .bind(account.rate_limit.reset_ms.map(|v| v as i64))
        .bind(&account.rate_limit.status_label)
        .bind(account.rate_limit.remaining.map(|v| v as i64))
        .bind(account.rate_limit.limited_until_ms.map(|v| v as i64))
        .bind(account.policy.paused)
        .bind(account.policy.priority)
        .bind(account.policy.auto_fallback_enabled)
        .bind(account.policy.auto_refresh_enabled)
        .bind(&account.policy.custom_endpoint)
        .bind(model_mappings)
        .execute(&self.pool)
        .await?;

        debug!(account_id = %account.id, "inserted account");
        Ok(())
    }

    pub async fn remove_account(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_all(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY priority DESC, name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_account).collect()
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    /// Persist a successful refresh. `refresh_token` is only updated when
    /// the provider rotated it.
    pub async fn update_tokens(
        &self,
        id: &str,
        access_token: &str,
        expires_at_ms: u64,
        refresh_token: Option<&str>,
    ) -> Result<()> {
        let result = if let Some(refresh) = refresh_token {
            sqlx::query(
                "UPDATE accounts SET access_token = ?, expires_at = ?, refresh_token = ? WHERE id = ?",
            )
            .bind(access_token)
            .bind(expires_at_ms as i64)
            .bind(refresh)
            .bind(id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE accounts SET access_token = ?, expires_at = ? WHERE id = ?")
                .bind(access_token)
                .bind(expires_at_ms as i64)
                .bind(id)
                .execute(&self.pool)
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        debug!(account_id = id, "updated tokens");
        Ok(())
    }

    /// Bump request counters and last-used timestamp. Always called,
    /// independent of session-affinity bookkeeping.
    pub async fn update_usage(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET request_count = request_count + 1,
             total_requests = total_requests + 1, last_used = ? WHERE id = ?",
        )
        .bind(now_ms() as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Update session-affinity fields, unless `bypass_session` is set (used
    /// by the AutoRefreshScheduler's synthetic warm-up requests, which must
    /// count toward usage without disturbing the real session window).
    pub async fn update_session_safe(&self, id: &str, bypass_session: bool) -> Result<()> {
        if bypass_session {
            return Ok(());
        }
        let result = sqlx::query(
            "UPDATE accounts SET
                session_start = COALESCE(session_start, ?),
                session_request_count = session_request_count + 1
             WHERE id = ?",
        )
        .bind(now_ms() as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_rate_limited(&self, id: &str, until_ms: u64) -> Result<()> {
        sqlx::query("UPDATE accounts SET rate_limited_until = ? WHERE id = ?")
            .bind(until_ms as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear `rate_limited_until` if it is in the past. This is the single
    /// site chosen for the "clear expired rate limit" behavior (see design
    /// notes on the duplicated source implementation) — called from the
    /// dispatcher's account-selection path only.
    pub async fn clear_rate_limited_if_expired(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET rate_limited_until = NULL
             WHERE id = ? AND rate_limited_until IS NOT NULL AND rate_limited_until < ?",
        )
        .bind(id)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_rate_limit_meta(
        &self,
        id: &str,
        status: Option<&str>,
        reset_ms: Option<u64>,
        remaining: Option<u64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET rate_limit_status = ?, rate_limit_reset = ?, rate_limit_remaining = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(reset_ms.map(|v| v as i64))
        .bind(remaining.map(|v| v as i64))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_auto_refresh_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE accounts SET auto_refresh_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_tier(&self, id: &str, tier: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET rate_limit_status = ? WHERE id = ?")
            .bind(tier)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_request_start(
        &self,
        request_id: &str,
        account_id: Option<&str>,
        method: &str,
        path: &str,
        timestamp_ms: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO requests (id, account_id, method, path, timestamp) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(request_id)
        .bind(account_id)
        .bind(method)
        .bind(path)
        .bind(timestamp_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_request_usage(&self, request_id: &str, usage: &RequestUsage) -> Result<()> {
        sqlx::query(
            "UPDATE requests SET model = COALESCE(?, model), input_tokens = ?,
             cache_read_input_tokens = ?, cache_creation_input_tokens = ?, output_tokens = ?,
             total_tokens = ?, cost_usd = ? WHERE id = ?",
        )
        .bind(&usage.model)
        .bind(usage.input_tokens as i64)
        .bind(usage.cache_read_input_tokens as i64)
        .bind(usage.cache_creation_input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.total_tokens as i64)
        .bind(usage.cost_usd)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the final request summary at `End`. Idempotent per
    /// `requestId`: a second call for the same id is a no-op update rather
    /// than a duplicate row, since `requests.id` is the primary key and the
    /// row was already created by `insert_request_start`.
    pub async fn finalize_request(&self, record: &RequestRecord) -> Result<()> {
        sqlx::query(
            "UPDATE requests SET account_id = ?, model = COALESCE(?, model), status = ?,
             success = ?, error = ?, agent_used = ?, input_tokens = ?, cache_read_input_tokens = ?,
             cache_creation_input_tokens = ?, output_tokens = ?, total_tokens = ?, cost_usd = ?,
             failover_attempts = ? WHERE id = ?",
        )
        .bind(&record.account_id)
        .bind(&record.model)
        .bind(record.status.map(|s| s as i64))
        .bind(record.success)
        .bind(&record.error)
        .bind(&record.agent_used)
        .bind(record.usage.input_tokens as i64)
        .bind(record.usage.cache_read_input_tokens as i64)
        .bind(record.usage.cache_creation_input_tokens as i64)
        .bind(record.usage.output_tokens as i64)
        .bind(record.usage.total_tokens as i64)
        .bind(record.usage.cost_usd)
        .bind(record.failover_attempts as i64)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the raw request/response bodies captured for one completed
    /// request — the audit payload served back by the admin API.
    pub async fn persist_payload(
        &self,
        request_id: &str,
        request_payload: Option<&[u8]>,
        response_payload: Option<&[u8]>,
    ) -> Result<()> {
        sqlx::query("UPDATE requests SET request_payload = ?, response_payload = ? WHERE id = ?")
            .bind(request_payload)
            .bind(response_payload)
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Durability mirror of an in-progress OAuth session; the in-memory
    /// `anthropic_auth::OAuthSessionStore` remains the authority for
    /// consume-once semantics.
    pub async fn insert_oauth_session(
        &self,
        id: &str,
        account_name: &str,
        mode: &str,
        code_verifier: &str,
        created_at_ms: u64,
        challenge: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO oauth_sessions (id, account_name, mode, code_verifier, created_at, challenge)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(account_name)
        .bind(mode)
        .bind(code_verifier)
        .bind(created_at_ms as i64)
        .bind(challenge)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_oauth_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM oauth_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn purge_expired_oauth_sessions(&self, ttl_ms: u64) -> Result<u64> {
        let cutoff = now_ms().saturating_sub(ttl_ms) as i64;
        let result = sqlx::query("DELETE FROM oauth_sessions WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl Account {
    fn credential_expires_at_i64(&self) -> Option<i64> {
        match &self.credential {
            Credential::OAuth { expires_at_ms, .. } => expires_at_ms.map(|v| v as i64),
            Credential::ApiKey { .. } => None,
        }
    }
}

fn credential_columns(
    credential: &Credential,
) -> (&'static str, Option<&str>, Option<&str>, Option<i64>, Option<&str>) {
    match credential {
        Credential::OAuth {
            refresh_token,
            access_token,
            expires_at_ms,
        } => (
            "oauth",
            Some(refresh_token.as_str()),
            access_token.as_deref(),
            expires_at_ms.map(|v| v as i64),
            None,
        ),
        Credential::ApiKey { secret } => ("api_key", None, None, None, Some(secret.as_str())),
    }
}

fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> Result<Account> {
    let credential_type: String = row.try_get("credential_type")?;
    let credential = if credential_type == "api_key" {
        Credential::ApiKey {
            secret: row.try_get("api_key")?,
        }
    } else {
        Credential::OAuth {
            refresh_token: row.try_get("refresh_token")?,
            access_token: row.try_get("access_token")?,
            expires_at_ms: row.try_get::<Option<i64>, _>("expires_at")?.map(|v| v as u64),
        }
    };

    let model_mappings: Option<String> = row.try_get("model_mappings")?;
    let model_mappings = model_mappings
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(Account {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        provider: row.try_get("provider")?,
        credential,
        created_at_ms: row.try_get::<Option<i64>, _>("created_at")?.map(|v| v as u64),
        usage: Usage {
            request_count: row.try_get::<i64, _>("request_count")? as u64,
            total_requests: row.try_get::<i64, _>("total_requests")? as u64,
            last_used_ms: row.try_get::<Option<i64>, _>("last_used")?.map(|v| v as u64),
            session_start_ms: row.try_get::<Option<i64>, _>("session_start")?.map(|v| v as u64),
            session_request_count: row.try_get::<i64, _>("session_request_count")? as u64,
        },
        rate_limit: RateLimit {
            limited_until_ms: row
                .try_get::<Option<i64>, _>("rate_limited_until")?
                .map(|v| v as u64),
            reset_ms: row.try_get::<Option<i64>, _>("rate_limit_reset")?.map(|v| v as u64),
            status_label: row.try_get("rate_limit_status")?,
            remaining: row
                .try_get::<Option<i64>, _>("rate_limit_remaining")?
                .map(|v| v as u64),
        },
        policy: Policy {
            paused: row.try_get("paused")?,
            priority: row.try_get("priority")?,
            auto_fallback_enabled: row.try_get("auto_fallback_enabled")?,
            auto_refresh_enabled: row.try_get("auto_refresh_enabled")?,
            custom_endpoint: row.try_get("custom_endpoint")?,
            model_mappings,
        },
    })
}
