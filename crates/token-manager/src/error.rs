//! Errors from credential resolution and refresh.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] account_store::Error),

    #[error(transparent)]
    Auth(#[from] anthropic_auth::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for common::ProxyError {
    fn from(err: Error) -> Self {
        match err {
            Error::Refresh(msg) => common::ProxyError::TokenRefresh(msg),
            Error::Unavailable(msg) => common::ProxyError::ServiceUnavailable(msg),
            Error::NotFound(msg) => common::ProxyError::Validation(msg),
            Error::Store(err) => common::ProxyError::Database(err.to_string()),
            Error::Auth(err) => common::ProxyError::TokenRefresh(err.to_string()),
        }
    }
}
