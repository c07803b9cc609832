//! Per-request wire-format adapter.
//!
//! `Provider` (see `lib.rs`) answers "which account, and is this error
//! retryable" for the token/pool layer. `ProviderAdapter` answers the
//! narrower, per-request question the dispatcher asks on every single
//! forwarded call: how to build the upstream URL, what headers and body
//! transforms this upstream expects, and how to read rate-limit/usage
//! information back out of its response. New upstreams register one
//! `ProviderAdapter` implementation into `AdapterRegistry` by name.

use reqwest::header::HeaderMap;
use serde_json::Value;

/// Rate-limit state extracted from an upstream response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RateLimitInfo {
    pub is_rate_limited: bool,
    /// Epoch ms when the limit resets, if the upstream provided one.
    pub reset_ms: Option<u64>,
}

/// Token usage extracted from a response body (streaming or not).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl UsageInfo {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// Per-request wire-format behavior for one upstream API.
///
/// Implementations are stateless with respect to a single call: any mutable
/// account state (tokens, rate limits) is read/written through the caller,
/// not held inside the adapter.
pub trait ProviderAdapter: Send + Sync {
    /// Name this adapter registers under (e.g. "anthropic").
    fn name(&self) -> &'static str;

    /// Whether this adapter handles the given inbound request path.
    fn can_handle(&self, path: &str) -> bool;

    /// Build the full upstream URL for a request path plus optional query string.
    fn build_url(&self, base: &str, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{base}{path}?{q}"),
            _ => format!("{base}{path}"),
        }
    }

    /// Mutate outbound headers in place: inject auth, strip hop-by-hop
    /// headers this adapter owns, add upstream-required flags.
    fn prepare_headers(
        &self,
        headers: &mut HeaderMap,
        access_token: Option<&str>,
        api_key: Option<&str>,
    );

    /// Read rate-limit state from response status + headers.
    fn parse_rate_limit(&self, status: u16, headers: &HeaderMap) -> RateLimitInfo;

    /// Some upstreams only reveal rate-limit state in the body (e.g. a 429
    /// JSON payload with no `Retry-After` header). Default: not supported.
    fn parse_rate_limit_from_body(&self, _body: &[u8]) -> Option<RateLimitInfo> {
        None
    }

    /// Whether this response is SSE/chunked streaming, based on headers.
    fn is_streaming_response(&self, headers: &HeaderMap) -> bool {
        headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
    }

    /// Optional account tier/plan label surfaced by the upstream.
    fn extract_tier_info(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }

    /// Parse token usage out of a full (non-streaming) or accumulated
    /// (streaming) response body.
    fn extract_usage_info(&self, _body: &[u8]) -> Option<UsageInfo> {
        None
    }

    /// Mutate the outbound JSON body in place before it is serialized and
    /// sent upstream (e.g. inject a required system prompt).
    fn transform_request_body(&self, _body: &mut Value) {}
}
