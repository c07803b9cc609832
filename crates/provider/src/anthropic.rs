//! `ProviderAdapter` implementation for Anthropic's `/v1/messages` API.
//!
//! Covers the wire-format concerns the dispatcher needs on every forwarded
//! request: required beta flags, the Claude Code identity headers, the
//! mandatory system-prompt prefix, and rate-limit/usage extraction from
//! responses. Account selection and token refresh live one layer up (in
//! `account-store`/`token-manager`); this adapter only ever sees the access
//! token or API key it's handed.

use crate::adapter::{ProviderAdapter, RateLimitInfo, UsageInfo};
use anthropic_auth::REQUIRED_SYSTEM_PROMPT_PREFIX;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

/// Required anthropic-beta flags. Always injected and merged with any
/// client-provided beta flags (deduplicated).
const REQUIRED_BETA_FLAGS: &[&str] = &[
    "oauth-2025-04-20",
    "interleaved-thinking-2025-05-14",
    "context-management-2025-06-27",
];

/// User-Agent header value matching the Claude CLI identity.
const USER_AGENT: &str = "claude-cli/2.0.76 (external, sdk-cli)";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for Anthropic's OAuth-fronted `/v1/messages` endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicAdapter;

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn can_handle(&self, path: &str) -> bool {
        path.starts_with("/v1/messages") || path.starts_with("/v1/complete")
    }

    fn prepare_headers(
        &self,
        headers: &mut HeaderMap,
        access_token: Option<&str>,
        api_key: Option<&str>,
    ) {
        headers.remove(reqwest::header::AUTHORIZATION);
        headers.remove("x-api-key");

        if let Some(token) = access_token {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(v) => {
                    headers.insert(reqwest::header::AUTHORIZATION, v);
                }
                Err(e) => warn!(error = %e, "invalid access token header value"),
            }
        } else if let Some(key) = api_key {
            match HeaderValue::from_str(key) {
                Ok(v) => {
                    headers.insert(HeaderName::from_static("x-api-key"), v);
                }
                Err(e) => warn!(error = %e, "invalid api key header value"),
            }
        }

        merge_beta_headers(headers);

        headers.insert(
            HeaderName::from_static("anthropic-dangerous-direct-browser-access"),
            HeaderValue::from_static("true"),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
    }

    fn parse_rate_limit(&self, status: u16, headers: &HeaderMap) -> RateLimitInfo {
        if status != 429 {
            return RateLimitInfo::default();
        }
        let reset_ms = parse_retry_after_ms(headers);
        RateLimitInfo {
            is_rate_limited: true,
            reset_ms,
        }
    }

    fn extract_tier_info(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get("anthropic-ratelimit-unified-tier")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn extract_usage_info(&self, body: &[u8]) -> Option<UsageInfo> {
        let parsed: Value = serde_json::from_slice(body).ok()?;
        let usage = parsed.get("usage")?;
        Some(UsageInfo {
            input_tokens: usage.get("input_tokens")?.as_u64().unwrap_or(0),
            output_tokens: usage.get("output_tokens")?.as_u64().unwrap_or(0),
            cache_creation_input_tokens: usage
                .get("cache_creation_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_read_input_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        })
    }

    fn transform_request_body(&self, body: &mut Value) {
        inject_system_prompt(body);
    }
}

/// Parse a `retry-after` or `retry-after-ms` header into an absolute epoch-ms
/// deadline. `retry-after-ms` takes priority when both are present.
fn parse_retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        return Some(common::time::now_ms() + ms);
    }
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
        .map(|secs| common::time::now_ms() + (secs * 1000.0) as u64)
}

/// Merge required anthropic-beta flags with any client-provided flags.
fn merge_beta_headers(headers: &mut HeaderMap) {
    let mut flags: Vec<String> = REQUIRED_BETA_FLAGS.iter().map(|s| s.to_string()).collect();

    if let Some(existing) = headers.get("anthropic-beta")
        && let Ok(existing_str) = existing.to_str()
    {
        for flag in existing_str.split(',') {
            let trimmed = flag.trim().to_string();
            if !trimmed.is_empty() && !flags.contains(&trimmed) {
                flags.push(trimmed);
            }
        }
    }

    let merged = flags.join(",");
    match HeaderValue::from_str(&merged) {
        Ok(v) => {
            headers.insert(HeaderName::from_static("anthropic-beta"), v);
        }
        Err(e) => warn!(error = %e, "failed to construct merged anthropic-beta header"),
    }
}

/// Extract the model name from a request body JSON object.
fn extract_model(body: &Value) -> Option<&str> {
    body.get("model").and_then(|m| m.as_str())
}

/// Inject the required system prompt prefix for non-Haiku models.
///
/// Rules:
/// - Haiku models: skip entirely (no system prompt required)
/// - No `system` field: create with required prefix
/// - Existing `system` without prefix: prepend prefix + space + existing
/// - Existing `system` already has prefix: no modification
fn inject_system_prompt(body: &mut Value) {
    let model = match extract_model(body) {
        Some(m) => m.to_lowercase(),
        None => return,
    };

    if model.contains("haiku") {
        debug!(model = %model, "skipping system prompt injection for haiku model");
        return;
    }

    match body.get("system") {
        None => {
            body["system"] = Value::String(REQUIRED_SYSTEM_PROMPT_PREFIX.to_string());
            debug!("injected system prompt (no existing system field)");
        }
        Some(existing) => {
            if let Some(existing_str) = existing.as_str()
                && !existing_str.starts_with(REQUIRED_SYSTEM_PROMPT_PREFIX)
            {
                body["system"] =
                    Value::String(format!("{REQUIRED_SYSTEM_PROMPT_PREFIX} {existing_str}"));
                debug!("prepended system prompt prefix to existing system field");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_handle_messages_path() {
        let adapter = AnthropicAdapter;
        assert!(adapter.can_handle("/v1/messages"));
        assert!(!adapter.can_handle("/v1/embeddings"));
    }

    #[test]
    fn prepare_headers_injects_bearer_token() {
        let adapter = AnthropicAdapter;
        let mut headers = HeaderMap::new();
        adapter.prepare_headers(&mut headers, Some("tok-123"), None);
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok-123");
        assert!(headers.get("x-api-key").is_none());
    }

    #[test]
    fn prepare_headers_falls_back_to_api_key() {
        let adapter = AnthropicAdapter;
        let mut headers = HeaderMap::new();
        adapter.prepare_headers(&mut headers, None, Some("sk-ant-key"));
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-key");
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn prepare_headers_strips_client_authorization() {
        let adapter = AnthropicAdapter;
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer client-sent"));
        adapter.prepare_headers(&mut headers, Some("real-token"), None);
        assert_eq!(headers.get("authorization").unwrap(), "Bearer real-token");
    }

    #[test]
    fn prepare_headers_sets_required_flags() {
        let adapter = AnthropicAdapter;
        let mut headers = HeaderMap::new();
        adapter.prepare_headers(&mut headers, Some("tok"), None);
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert_eq!(headers.get("user-agent").unwrap(), USER_AGENT);
        let beta = headers.get("anthropic-beta").unwrap().to_str().unwrap();
        for flag in REQUIRED_BETA_FLAGS {
            assert!(beta.contains(flag));
        }
    }

    #[test]
    fn parse_rate_limit_non_429_is_not_limited() {
        let adapter = AnthropicAdapter;
        let headers = HeaderMap::new();
        let info = adapter.parse_rate_limit(200, &headers);
        assert!(!info.is_rate_limited);
    }

    #[test]
    fn parse_rate_limit_429_with_retry_after_ms() {
        let adapter = AnthropicAdapter;
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("5000"));
        let info = adapter.parse_rate_limit(429, &headers);
        assert!(info.is_rate_limited);
        assert!(info.reset_ms.is_some());
    }

    #[test]
    fn parse_rate_limit_429_with_retry_after_seconds() {
        let adapter = AnthropicAdapter;
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, HeaderValue::from_static("30"));
        let info = adapter.parse_rate_limit(429, &headers);
        assert!(info.is_rate_limited);
        assert!(info.reset_ms.unwrap() >= common::time::now_ms() + 29_000);
    }

    #[test]
    fn extract_usage_info_reads_usage_block() {
        let adapter = AnthropicAdapter;
        let body = serde_json::json!({
            "usage": {"input_tokens": 10, "output_tokens": 25}
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let usage = adapter.extract_usage_info(&bytes).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 25);
        assert_eq!(usage.total_tokens(), 35);
    }

    #[test]
    fn extract_usage_info_missing_usage_is_none() {
        let adapter = AnthropicAdapter;
        let body = serde_json::json!({"model": "claude-opus-4"});
        let bytes = serde_json::to_vec(&body).unwrap();
        assert!(adapter.extract_usage_info(&bytes).is_none());
    }

    #[test]
    fn transform_request_body_injects_prompt_for_non_haiku() {
        let adapter = AnthropicAdapter;
        let mut body = serde_json::json!({"model": "claude-opus-4-20250514", "messages": []});
        adapter.transform_request_body(&mut body);
        assert_eq!(body["system"], REQUIRED_SYSTEM_PROMPT_PREFIX);
    }

    #[test]
    fn transform_request_body_skips_haiku() {
        let adapter = AnthropicAdapter;
        let mut body = serde_json::json!({"model": "claude-3-5-haiku-20241022", "messages": []});
        adapter.transform_request_body(&mut body);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn transform_request_body_prepends_to_existing_system() {
        let adapter = AnthropicAdapter;
        let mut body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "system": "Be concise.",
        });
        adapter.transform_request_body(&mut body);
        let system = body["system"].as_str().unwrap();
        assert!(system.starts_with(REQUIRED_SYSTEM_PROMPT_PREFIX));
        assert!(system.ends_with("Be concise."));
    }

    #[test]
    fn transform_request_body_idempotent_when_prefix_present() {
        let adapter = AnthropicAdapter;
        let existing = format!("{REQUIRED_SYSTEM_PROMPT_PREFIX} extra");
        let mut body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "system": existing.clone(),
        });
        adapter.transform_request_body(&mut body);
        assert_eq!(body["system"], existing);
    }
}
