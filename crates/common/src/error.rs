//! Common error types

use thiserror::Error;

/// Common error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Cross-cutting error taxonomy shared by the dispatch path.
///
/// These are kinds, not crate-specific error types: `token-manager`,
/// `proxy-core`, and the service binary all produce and match on this enum
/// so that HTTP status mapping happens in exactly one place.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Caller-visible 4xx: path not handled by any adapter, malformed input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Wraps a token refresh network/parse failure. Not directly user-visible;
    /// yields a 503 at the dispatch boundary if no other account remains.
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    /// Internal signal only — the dispatcher tries the next account, never
    /// surfaced to the client as an error response.
    #[error("rate limited")]
    RateLimit,

    /// Upstream 5xx or proxy-level transport failure, surfaced as 502.
    #[error("provider error: {0}")]
    Provider(String),

    /// All accounts failed, or token refresh is in backoff. Surfaced as 503.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Account store read/write failure. The dispatcher logs this and
    /// degrades to unauthenticated forwarding rather than failing the request.
    #[error("database error: {0}")]
    Database(String),

    /// 401 from upstream during an auto-refresh warm-up. Disables
    /// auto-refresh for that account.
    #[error("authentication failure for account {account_id}")]
    AuthenticationFailure { account_id: String },
}

impl ProxyError {
    /// HTTP status this error kind maps to at the dispatch boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Validation(_) => 400,
            ProxyError::Provider(_) => 502,
            ProxyError::ServiceUnavailable(_) => 503,
            ProxyError::TokenRefresh(_) => 503,
            ProxyError::RateLimit => 503,
            ProxyError::Database(_) => 502,
            ProxyError::AuthenticationFailure { .. } => 401,
        }
    }
}
