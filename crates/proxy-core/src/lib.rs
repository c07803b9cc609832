//! Request dispatch, response post-processing, and the supporting policy
//! modules shared by the proxy's HTTP surface.

pub mod agent_interceptor;
pub mod cost;
pub mod dispatcher;
pub mod error;
pub mod header_codec;
pub mod post_processor;
pub mod response_forwarder;
pub mod strategy;
pub mod types;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use post_processor::{PostProcessor, SinkEvent, SinkTuning};
pub use response_forwarder::{ForwardContext, Upstream};
pub use strategy::{SessionAffinityStrategy, Strategy};
pub use types::{RequestMeta, BYPASS_SESSION_HEADER, FORCE_ACCOUNT_HEADER};
