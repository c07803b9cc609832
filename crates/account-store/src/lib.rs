//! Persistence layer for accounts, in-progress OAuth sessions, and the
//! per-request audit trail, backed by sqlite.

pub mod error;
pub mod store;
pub mod types;
pub mod writer;

pub use error::{Error, Result};
pub use store::AccountStore;
pub use types::{
    Account, AccountHealth, Credential, HealthReport, HealthStatus, HealthSummary, Policy,
    RateLimit, RequestRecord, RequestUsage, Usage,
};
pub use writer::{AsyncDbWriter, WriteJob};
