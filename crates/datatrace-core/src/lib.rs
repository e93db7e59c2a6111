//! DataTrace Core - label sets, correlation state, and the label policy engine
//!
//! This crate provides the building blocks of the DataTrace filter:
//!
//! - **Labels**: the `;`-delimited label payload carried in `x-data`
//! - **Store**: shared per-trace correlation state
//! - **Policy**: phase-scoped label actions, override parsing, evaluation
//! - **Config**: TOML configuration and YAML policy files
//! - **Metrics**: filter counters with Prometheus rendering

pub mod config;
pub mod headers;
pub mod labels;
pub mod metrics;
pub mod policy;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigError, ConfigLoader, FilterConfig};
pub use headers::HeaderAccess;
pub use labels::{LabelSet, DELIMITER, NO_DATA};
pub use metrics::{FilterMetrics, MetricsSnapshot};
pub use policy::{
    Operation, OverrideMode, Phase, Policy, PolicyAction, PolicyError, PolicyEvaluator,
};
pub use store::{ConcurrentStore, CorrelationStore, LockedStore};

/// Filter name registered with the host proxy
pub const FILTER_NAME: &str = "netsys.data_tracing";

/// Filter version
pub const FILTER_VERSION: &str = env!("CARGO_PKG_VERSION");
