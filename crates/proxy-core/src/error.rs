//! Errors from request dispatch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no provider adapter handles path {0}")]
    NoAdapter(String),

    #[error("service unavailable after {attempts} attempt(s): {reason}")]
    ServiceUnavailable { attempts: u32, reason: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    TokenManager(#[from] token_manager::Error),

    #[error(transparent)]
    Store(#[from] account_store::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for common::ProxyError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => common::ProxyError::Validation(msg),
            Error::NoAdapter(path) => common::ProxyError::Validation(format!("unhandled path: {path}")),
            Error::ServiceUnavailable { reason, .. } => common::ProxyError::ServiceUnavailable(reason),
            Error::Provider(msg) => common::ProxyError::Provider(msg),
            Error::TokenManager(err) => err.into(),
            Error::Store(err) => common::ProxyError::Database(err.to_string()),
            Error::Http(err) => common::ProxyError::Provider(err.to_string()),
        }
    }
}
