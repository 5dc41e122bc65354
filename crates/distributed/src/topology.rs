//! Shard topology resolution.

use std::collections::BTreeSet;

use scatter_common::{Result, SearchTarget, ShardId};

use crate::request::SearchRequest;
use crate::shard_iterator::ShardIterator;

/// Supplies the shard copies a request fans out to.
pub trait TopologyResolver: Send + Sync {
    /// Ordered copies of every participating shard, with pre-skipped shards
    /// marked.
    fn resolve(&self, request: &SearchRequest) -> Result<Vec<ShardIterator>>;
}

/// Fixed routing table.
///
/// Shards registered through [`StaticTopology::with_skipped_shard`] are always
/// handed out pre-skipped; shards of an index listed by
/// [`StaticTopology::skip_index`] are skipped for every request.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    shards: Vec<ShardIterator>,
    skipped_indices: BTreeSet<String>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shard(mut self, shard_id: ShardId, targets: Vec<SearchTarget>) -> Self {
        self.shards.push(ShardIterator::new(shard_id, targets));
        self
    }

    /// Shard of a remote cluster; every copy carries the alias.
    pub fn with_remote_shard(
        mut self,
        cluster_alias: impl Into<String>,
        shard_id: ShardId,
        nodes: &[&str],
    ) -> Self {
        let alias = cluster_alias.into();
        let targets = nodes
            .iter()
            .map(|n| SearchTarget::remote(alias.clone(), *n))
            .collect();
        self.shards
            .push(ShardIterator::new(shard_id, targets).with_cluster_alias(Some(alias)));
        self
    }

    pub fn with_skipped_shard(mut self, shard_id: ShardId, targets: Vec<SearchTarget>) -> Self {
        self.shards
            .push(ShardIterator::new(shard_id, targets).with_skip(true));
        self
    }

    pub fn skip_index(mut self, index: impl Into<String>) -> Self {
        self.skipped_indices.insert(index.into());
        self
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}

impl TopologyResolver for StaticTopology {
    fn resolve(&self, _request: &SearchRequest) -> Result<Vec<ShardIterator>> {
        Ok(self
            .shards
            .iter()
            .cloned()
            .map(|it| {
                let skip = it.skip() || self.skipped_indices.contains(&it.shard_id().index);
                it.with_skip(skip)
            })
            .collect())
    }
}
