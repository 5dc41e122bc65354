//! Shared configuration, error types, IDs, breaker and metrics for the
//! scatter search coordinator crates.
//!
//! Architecture role:
//! - defines coordinator configuration passed across layers
//! - provides the common [`SearchError`] / [`Result`] contracts and the
//!   exported [`ShardSearchFailure`] record
//! - hosts the request circuit breaker and the metrics registry
//!
//! Key modules:
//! - [`breaker`]
//! - [`config`]
//! - [`error`]
//! - [`failure`]
//! - [`ids`]
//! - [`metrics`]

pub mod breaker;
pub mod config;
pub mod error;
pub mod failure;
pub mod ids;
pub mod metrics;

pub use breaker::{BreakerReservation, CircuitBreaker};
pub use config::CoordinatorConfig;
pub use error::{Result, SearchError};
pub use failure::{ShardSearchFailure, group_by_root_cause};
pub use ids::*;
pub use metrics::{MetricsRegistry, global_metrics};
