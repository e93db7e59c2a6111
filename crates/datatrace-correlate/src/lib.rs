//! Trace correlation and label propagation
//!
//! Correlates each request with its response and with nested requests that
//! share the same `x-request-id`, keeping the label payload of every open
//! trace in a shared [`CorrelationStore`](datatrace_core::CorrelationStore).

pub mod filter;
pub mod replay;
pub mod sweeper;

pub use filter::{DataTracingFilter, ExchangeContext, FilterStatus};
pub use replay::{ExchangeReplay, ReplayError, ReplayEvent, ReplayOutcome};
pub use sweeper::spawn_sweeper;
