//! Ordered cursor over the copies of one shard.

use std::cmp::Ordering;
use std::collections::VecDeque;

use scatter_common::{SearchTarget, ShardId};

/// Candidate copies of one shard, tried front to back.
///
/// Iterators are totally ordered by `(shard_id, cluster_alias)` so that
/// shard-index assignment is reproducible for the same logical request.
#[derive(Debug, Clone)]
pub struct ShardIterator {
    shard_id: ShardId,
    cluster_alias: Option<String>,
    targets: VecDeque<SearchTarget>,
    size: usize,
    skip: bool,
}

impl ShardIterator {
    pub fn new(shard_id: ShardId, targets: Vec<SearchTarget>) -> Self {
        let size = targets.len();
        Self {
            shard_id,
            cluster_alias: None,
            targets: targets.into(),
            size,
            skip: false,
        }
    }

    /// Iterator over exactly one copy, used by phases that must go back to the
    /// node holding the shard's search context.
    pub fn single(shard_id: ShardId, target: SearchTarget) -> Self {
        let cluster_alias = target.cluster_alias.clone();
        Self::new(shard_id, vec![target]).with_cluster_alias(cluster_alias)
    }

    pub fn with_cluster_alias(mut self, cluster_alias: Option<String>) -> Self {
        self.cluster_alias = cluster_alias;
        self
    }

    /// Mark the shard as statically known to match nothing.
    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn cluster_alias(&self) -> Option<&str> {
        self.cluster_alias.as_deref()
    }

    /// Next untried copy, `None` once every copy was handed out.
    pub fn next_or_none(&mut self) -> Option<SearchTarget> {
        self.targets.pop_front()
    }

    /// Copies not handed out yet.
    pub fn remaining(&self) -> usize {
        self.targets.len()
    }

    /// Total number of copies this iterator started with.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn skip(&self) -> bool {
        self.skip
    }
}

impl PartialEq for ShardIterator {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ShardIterator {}

impl PartialOrd for ShardIterator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShardIterator {
    fn cmp(&self, other: &Self) -> Ordering {
        self.shard_id
            .cmp(&other.shard_id)
            .then_with(|| self.cluster_alias.cmp(&other.cluster_alias))
    }
}

/// One participating shard of one phase.
///
/// `shard_index` is fixed for the whole request and is the only key used by
/// result and failure bookkeeping.
#[derive(Debug, Clone)]
pub struct ShardExecutionUnit {
    pub shard_index: usize,
    pub iterator: ShardIterator,
}

impl ShardExecutionUnit {
    pub fn new(shard_index: usize, iterator: ShardIterator) -> Self {
        Self {
            shard_index,
            iterator,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        self.iterator.shard_id()
    }

    /// Ops this unit contributes to the phase's expected total.
    pub(crate) fn expected_ops(&self) -> usize {
        self.iterator.size().max(1)
    }
}

/// Sort iterators into their canonical order and number them `0..n`.
pub fn assign_shard_indices(mut iterators: Vec<ShardIterator>) -> Vec<ShardExecutionUnit> {
    iterators.sort();
    iterators
        .into_iter()
        .enumerate()
        .map(|(shard_index, iterator)| ShardExecutionUnit::new(shard_index, iterator))
        .collect()
}
