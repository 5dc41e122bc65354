//! Scatter-gather execution of search requests across shard copies.
//!
//! Architecture role:
//! - resolves a request to participating shards, numbers them and runs the
//!   dfs, query, rank-feature and fetch phases over them
//! - retries each shard on its next copy after a failure and settles every
//!   phase exactly once, with a verdict on partial results
//! - bounds in-flight shard requests per node and frees remote search
//!   contexts that no later phase needs
//!
//! Key modules:
//! - [`coordinator`]: per-phase fan-out, retry and accounting
//! - [`pipeline`]: phase sequencing of one request
//! - [`throttle`]: per-node pending execution queues
//! - [`transport`]: transport seam and the in-process transport
//! - [`searcher`]: in-memory shard searcher used by the in-process transport

pub mod cancellation;
pub mod contexts;
pub mod coordinator;
pub mod failure_tracker;
pub mod phases;
pub mod pipeline;
pub mod progress;
pub mod reduce;
pub mod request;
pub mod response;
pub mod result_sink;
pub mod results;
pub mod searcher;
pub mod shard_iterator;
pub mod throttle;
pub mod topology;
pub mod transport;

pub use cancellation::{CancellationBridge, SearchTask};
pub use coordinator::{PhaseContext, PhaseCoordinator, PhaseOptions, PhaseOutcome, ShardAttempt, ShardPhase};
pub use pipeline::SearchAction;
pub use progress::{NoopProgressListener, SearchProgressListener};
pub use request::{KnnSearch, PointInTime, SearchRequest, SearchType};
pub use response::{SearchResponse, ShardStats};
pub use searcher::{Fault, InMemoryShardSearcher, IndexedDoc};
pub use shard_iterator::{ShardExecutionUnit, ShardIterator, assign_shard_indices};
pub use topology::{StaticTopology, TopologyResolver};
pub use transport::{InProcessTransport, SearchTransport, ShardAction, ShardSearcher};
