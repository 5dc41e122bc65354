//! Search requests: the client-level request and the per-shard envelopes each
//! phase sends to remote nodes.

use std::sync::Arc;

use scatter_common::{ContextId, CoordinatorConfig, Result, SearchError, ShardId};
use serde::{Deserialize, Serialize};

use crate::results::{AggregatedDfs, QuerySearchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchType {
    /// query → [rank-feature] → fetch
    #[default]
    QueryThenFetch,
    /// dfs → query → [rank-feature] → fetch, scoring with global term statistics
    DfsQueryThenFetch,
}

/// Approximate nearest-neighbour clause. Its candidates are gathered in the
/// dfs phase and merged globally before the query phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnSearch {
    pub field: String,
    pub query_vector: Vec<f32>,
    /// Global number of nearest neighbours kept after the dfs merge.
    pub k: usize,
    /// Candidates each shard contributes.
    pub num_candidates: usize,
}

/// Point-in-time session; its contexts outlive the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointInTime {
    pub id: String,
    pub keep_alive_ms: u64,
}

/// Client-level search request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Terms of the (opaque) scoring query.
    pub query_terms: Vec<String>,
    pub from: usize,
    pub size: usize,
    pub search_type: SearchType,
    /// `None` uses [`CoordinatorConfig::allow_partial_search_results`].
    pub allow_partial_search_results: Option<bool>,
    /// Enables the rank-feature phase over the top `rank_window_size` hits.
    pub rank_window_size: Option<usize>,
    pub knn: Option<KnnSearch>,
    pub point_in_time: Option<PointInTime>,
    /// `None` uses [`CoordinatorConfig::max_concurrent_shard_requests`].
    pub max_concurrent_shard_requests: Option<usize>,
}

impl SearchRequest {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query_terms: terms.into_iter().map(Into::into).collect(),
            size: 10,
            ..Self::default()
        }
    }

    pub fn with_window(mut self, from: usize, size: usize) -> Self {
        self.from = from;
        self.size = size;
        self
    }

    pub fn with_search_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn with_allow_partial_search_results(mut self, allow: bool) -> Self {
        self.allow_partial_search_results = Some(allow);
        self
    }

    pub fn with_rank_window_size(mut self, window: usize) -> Self {
        self.rank_window_size = Some(window);
        self
    }

    pub fn with_knn(mut self, knn: KnnSearch) -> Self {
        self.knn = Some(knn);
        self
    }

    pub fn with_point_in_time(mut self, pit: PointInTime) -> Self {
        self.point_in_time = Some(pit);
        self
    }

    pub fn with_max_concurrent_shard_requests(mut self, max: usize) -> Self {
        self.max_concurrent_shard_requests = Some(max);
        self
    }

    /// kNN clauses need the dfs round to merge candidates globally.
    pub fn effective_search_type(&self) -> SearchType {
        if self.knn.is_some() {
            SearchType::DfsQueryThenFetch
        } else {
            self.search_type
        }
    }

    pub fn allow_partial_results(&self, config: &CoordinatorConfig) -> bool {
        self.allow_partial_search_results
            .unwrap_or(config.allow_partial_search_results)
    }

    pub fn max_concurrent_requests(&self, config: &CoordinatorConfig) -> usize {
        self.max_concurrent_shard_requests
            .unwrap_or(config.max_concurrent_shard_requests)
    }

    /// Number of top hits every shard must return in the query phase.
    pub fn query_window(&self) -> usize {
        let window = self.from + self.size;
        self.rank_window_size.map_or(window, |r| r.max(window))
    }

    pub fn validate(&self, config: &CoordinatorConfig) -> Result<()> {
        let window = self.from.saturating_add(self.size);
        if window > config.max_result_window {
            return Err(SearchError::InvalidConfig(format!(
                "result window is too large, from + size must be less than or equal to [{}] but was [{window}]",
                config.max_result_window
            )));
        }
        if let Some(rank_window) = self.rank_window_size {
            if rank_window < window {
                return Err(SearchError::InvalidConfig(format!(
                    "rank_window_size [{rank_window}] must be greater than or equal to from + size [{window}]"
                )));
            }
        }
        if self.max_concurrent_shard_requests == Some(0) {
            return Err(SearchError::InvalidConfig(
                "max_concurrent_shard_requests must be at least 1".to_string(),
            ));
        }
        if let Some(knn) = &self.knn {
            if knn.k == 0 || knn.num_candidates < knn.k {
                return Err(SearchError::InvalidConfig(format!(
                    "knn requires 0 < k <= num_candidates, got k={} num_candidates={}",
                    knn.k, knn.num_candidates
                )));
            }
        }
        Ok(())
    }
}

/// Query-phase (and dfs-phase) request for one shard.
#[derive(Debug, Clone)]
pub struct ShardSearchRequest {
    pub shard_id: ShardId,
    pub shard_index: usize,
    pub num_shards: usize,
    pub cluster_alias: Option<String>,
    pub query_terms: Vec<String>,
    /// Top hits to keep on the shard.
    pub size: usize,
    pub knn: Option<KnnSearch>,
    /// Global term statistics from the dfs round.
    pub aggregated_dfs: Option<Arc<AggregatedDfs>>,
    /// Candidate-document filter injected at the dfs→query boundary.
    pub candidate_docs: Option<Vec<u32>>,
    /// Shard may answer "no match" without opening a context.
    pub can_return_null_response_if_match_no_docs: bool,
    /// Context opened by an earlier phase (dfs) or a point-in-time.
    pub context_id: Option<ContextId>,
    pub point_in_time: bool,
}

/// Batched query envelope: every shard of one node in one request.
#[derive(Debug, Clone)]
pub struct NodeQueryRequest {
    pub shards: Vec<ShardSearchRequest>,
}

/// One outcome per descriptor of the matching [`NodeQueryRequest`], same order.
#[derive(Debug)]
pub struct NodeQueryResponse {
    pub results: Vec<Result<QuerySearchResult>>,
}

#[derive(Debug, Clone)]
pub struct RankFeatureShardRequest {
    pub shard_id: ShardId,
    pub shard_index: usize,
    pub context_id: ContextId,
    pub doc_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct ShardFetchRequest {
    pub shard_id: ShardId,
    pub shard_index: usize,
    pub context_id: ContextId,
    pub doc_ids: Vec<u32>,
    /// Remote frees the context once the fetch completes.
    pub free_context: bool,
}
