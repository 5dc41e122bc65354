//! Progress notifications emitted while a search runs.

use scatter_common::{SearchError, ShardSearchFailure};

use crate::shard_iterator::ShardExecutionUnit;

/// Observer of shard-level progress. Every method defaults to a no-op.
///
/// Callbacks run on whatever task completed the shard and must not block.
pub trait SearchProgressListener: Send + Sync {
    /// Participating shards of the request, after index assignment.
    fn on_list_shards(&self, _units: &[ShardExecutionUnit]) {}

    fn on_shard_result(&self, _phase: &str, _shard_index: usize) {}

    fn on_shard_failure(&self, _phase: &str, _failure: &ShardSearchFailure) {}

    /// The shard exhausted every copy in this phase.
    fn on_shard_group_failure(&self, _phase: &str, _shard_index: usize, _cause: &SearchError) {}

    /// Terminal accounting of a phase was reached.
    fn on_phase_done(&self, _phase: &str, _successful: usize, _num_shards: usize) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressListener;

impl SearchProgressListener for NoopProgressListener {}
