//! Auto-refresh scheduling: keeps refresh-credential-backed accounts warm
//! by periodically probing the proxy's own HTTP surface.

pub mod auto_refresh;
pub mod error;

pub use auto_refresh::{AutoRefreshScheduler, SchedulerTuning, FAILURE_THRESHOLD, TICK};
pub use error::{Error, Result};
