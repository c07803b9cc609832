//! The `Account` aggregate and its constituent value types.

use serde::{Deserialize, Serialize};

/// A persistent upstream identity, identified by a stable `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// Tag selecting a provider adapter: "anthropic", "openai-compatible", "zai", …
    pub provider: String,
    pub credential: Credential,
    /// For refresh-token age classification. Absent means "unknown age".
    pub created_at_ms: Option<u64>,
    pub usage: Usage,
    pub rate_limit: RateLimit,
    pub policy: Policy,
}

/// Either an OAuth-managed account or a static API-key account.
///
/// Invariant: `ApiKey` accounts never carry a refresh token, and the proxy
/// never attempts an OAuth refresh for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credential {
    OAuth {
        refresh_token: String,
        access_token: Option<String>,
        /// Present whenever `access_token` is present.
        expires_at_ms: Option<u64>,
    },
    ApiKey {
        secret: String,
    },
}

impl Credential {
    pub fn is_api_key(&self) -> bool {
        matches!(self, Credential::ApiKey { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub request_count: u64,
    pub total_requests: u64,
    pub last_used_ms: Option<u64>,
    pub session_start_ms: Option<u64>,
    pub session_request_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimit {
    pub limited_until_ms: Option<u64>,
    /// `resetMs` is monotonic per window: a value strictly greater than the
    /// last observed implies the window rolled over.
    pub reset_ms: Option<u64>,
    pub status_label: Option<String>,
    pub remaining: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub paused: bool,
    pub priority: i64,
    pub auto_fallback_enabled: bool,
    pub auto_refresh_enabled: bool,
    pub custom_endpoint: Option<String>,
    pub model_mappings: Option<serde_json::Value>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            paused: false,
            priority: 0,
            auto_fallback_enabled: true,
            auto_refresh_enabled: true,
            custom_endpoint: None,
            model_mappings: None,
        }
    }
}

/// Health classification for one account, as produced by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Expired,
    NoRefreshToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountHealth {
    pub account_id: String,
    pub status: HealthStatus,
    pub age_days: Option<i64>,
    pub days_until_expiration: Option<i64>,
    pub requires_reauth: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub expired: usize,
    pub no_refresh_token: usize,
    pub requires_reauth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at_ms: u64,
    pub per_account: Vec<AccountHealth>,
    pub summary: HealthSummary,
}

/// Per-request usage accumulator as maintained by the PostProcessor and
/// persisted via `AccountStore::update_request_usage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestUsage {
    pub model: Option<String>,
    pub input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: Option<f64>,
}

/// A persisted summary row for one completed request, written by the
/// PostProcessor at `End`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub account_id: Option<String>,
    pub model: Option<String>,
    pub method: String,
    pub path: String,
    pub status: Option<u16>,
    pub success: bool,
    pub error: Option<String>,
    pub agent_used: Option<String>,
    pub usage: RequestUsage,
    pub failover_attempts: u32,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_credential_reports_no_refresh() {
        let cred = Credential::ApiKey {
            secret: "sk-ant-123".into(),
        };
        assert!(cred.is_api_key());
    }

    #[test]
    fn oauth_credential_is_not_api_key() {
        let cred = Credential::OAuth {
            refresh_token: "rt".into(),
            access_token: Some("at".into()),
            expires_at_ms: Some(1_000),
        };
        assert!(!cred.is_api_key());
    }

    #[test]
    fn policy_default_matches_spec_defaults() {
        let policy = Policy::default();
        assert!(!policy.paused);
        assert!(policy.auto_fallback_enabled);
        assert!(policy.auto_refresh_enabled);
        assert_eq!(policy.priority, 0);
    }

    #[test]
    fn credential_serde_roundtrip_tags_variant() {
        let cred = Credential::OAuth {
            refresh_token: "rt".into(),
            access_token: None,
            expires_at_ms: None,
        };
        let json = serde_json::to_value(&cred).unwrap();
        assert_eq!(json["type"], "OAuth");
    }
}
