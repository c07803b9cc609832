//! Provider abstraction for upstream API request/response translation.
//!
//! `ProviderAdapter` is the per-request wire-format seam: it knows how to
//! build an upstream URL, inject auth headers, and parse rate-limit/usage
//! information out of an upstream response for one provider's API shape.
//! The `AdapterRegistry` dispatches an inbound path to the adapter that
//! claims it.

pub mod adapter;
pub mod anthropic;
pub mod registry;

pub use adapter::{ProviderAdapter, RateLimitInfo, UsageInfo};
pub use anthropic::AnthropicAdapter;
pub use registry::AdapterRegistry;
