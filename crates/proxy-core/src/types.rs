//! Request-scoped metadata threaded through the dispatch pipeline.

use http::HeaderMap;

/// Header carrying an explicit account id, bypassing strategy selection.
pub const FORCE_ACCOUNT_HEADER: &str = "x-ccproxy-account-id";
/// Header marking a synthetic request (the AutoRefreshScheduler's warm-up
/// call) so usage accounting touches counters but not session affinity.
pub const BYPASS_SESSION_HEADER: &str = "x-ccproxy-bypass-session";

#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub timestamp_ms: u64,
    pub headers: HeaderMap,
}

impl RequestMeta {
    /// Build request metadata for an inbound call, minting a fresh request id.
    pub fn new(method: String, path: String, headers: HeaderMap) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method,
            path,
            timestamp_ms: common::time::now_ms(),
            headers,
        }
    }

    pub fn forced_account_id(&self) -> Option<String> {
        self.headers
            .get(FORCE_ACCOUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn bypass_session(&self) -> bool {
        self.headers
            .get(BYPASS_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}
