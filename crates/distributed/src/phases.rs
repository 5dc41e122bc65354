//! Concrete search phases: dfs, query, rank-feature and fetch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use scatter_common::{ContextId, Result, SearchError};

use crate::coordinator::{ShardAttempt, ShardPhase};
use crate::request::{
    KnnSearch, NodeQueryRequest, RankFeatureShardRequest, SearchRequest, ShardFetchRequest,
    ShardSearchRequest,
};
use crate::results::{
    AggregatedDfs, DfsSearchResult, FetchSearchResult, QuerySearchResult, RankFeatureResult,
};
use crate::transport::{Connection, SearchTransport};

/// Request-level parts of every per-shard search request.
#[derive(Debug, Clone)]
pub struct ShardRequestTemplate {
    pub query_terms: Vec<String>,
    pub size: usize,
    pub knn: Option<KnnSearch>,
    pub total_shards: usize,
    pub point_in_time: bool,
}

impl ShardRequestTemplate {
    pub fn from_request(request: &SearchRequest, total_shards: usize) -> Self {
        Self {
            query_terms: request.query_terms.clone(),
            size: request.query_window(),
            knn: request.knn.clone(),
            total_shards,
            point_in_time: request.point_in_time.is_some(),
        }
    }

    pub fn shard_request(&self, attempt: &ShardAttempt) -> ShardSearchRequest {
        ShardSearchRequest {
            shard_id: attempt.shard_id.clone(),
            shard_index: attempt.shard_index,
            num_shards: self.total_shards,
            cluster_alias: attempt.target.cluster_alias.clone(),
            query_terms: self.query_terms.clone(),
            size: self.size,
            knn: self.knn.clone(),
            aggregated_dfs: None,
            candidate_docs: None,
            can_return_null_response_if_match_no_docs: false,
            context_id: None,
            point_in_time: self.point_in_time,
        }
    }
}

/// Collects per-shard term statistics and kNN candidates.
#[derive(Debug)]
pub struct DfsPhase {
    template: Arc<ShardRequestTemplate>,
}

impl DfsPhase {
    pub fn new(template: Arc<ShardRequestTemplate>) -> Self {
        Self { template }
    }
}

#[async_trait]
impl ShardPhase for DfsPhase {
    type Output = DfsSearchResult;

    fn name(&self) -> &'static str {
        "dfs"
    }

    async fn execute(
        &self,
        transport: &dyn SearchTransport,
        conn: &Connection,
        attempt: &ShardAttempt,
    ) -> Result<DfsSearchResult> {
        transport
            .execute_dfs(conn, self.template.shard_request(attempt), attempt.task)
            .await
    }
}

/// Per-shard top-k retrieval.
#[derive(Debug)]
pub struct QueryPhase {
    template: Arc<ShardRequestTemplate>,
    aggregated_dfs: Option<Arc<AggregatedDfs>>,
    contexts: HashMap<usize, ContextId>,
    batched: bool,
}

impl QueryPhase {
    pub fn new(template: Arc<ShardRequestTemplate>) -> Self {
        Self {
            template,
            aggregated_dfs: None,
            contexts: HashMap::new(),
            batched: false,
        }
    }

    /// Score with global statistics and reuse the contexts opened by dfs.
    pub fn with_dfs(
        mut self,
        aggregated_dfs: Arc<AggregatedDfs>,
        contexts: HashMap<usize, ContextId>,
    ) -> Self {
        self.aggregated_dfs = Some(aggregated_dfs);
        self.contexts = contexts;
        self
    }

    pub fn with_batching(mut self, batched: bool) -> Self {
        self.batched = batched;
        self
    }

    /// Shard request for `attempt`, narrowed by what earlier phases learned.
    pub fn rewrite(&self, attempt: &ShardAttempt) -> ShardSearchRequest {
        let mut request = self.template.shard_request(attempt);
        if let Some(dfs) = &self.aggregated_dfs {
            if request.knn.is_some() {
                request.candidate_docs = Some(dfs.knn_docs_for(attempt.shard_index));
            }
            request.aggregated_dfs = Some(Arc::clone(dfs));
        }
        request.context_id = self.contexts.get(&attempt.shard_index).cloned();
        request.can_return_null_response_if_match_no_docs =
            attempt.has_shard_response && attempt.num_shards > 1;
        request
    }
}

#[async_trait]
impl ShardPhase for QueryPhase {
    type Output = QuerySearchResult;

    fn name(&self) -> &'static str {
        "query"
    }

    async fn execute(
        &self,
        transport: &dyn SearchTransport,
        conn: &Connection,
        attempt: &ShardAttempt,
    ) -> Result<QuerySearchResult> {
        transport
            .execute_query(conn, self.rewrite(attempt), attempt.task)
            .await
    }

    fn supports_batching(&self) -> bool {
        self.batched
    }

    async fn execute_batch(
        &self,
        transport: &dyn SearchTransport,
        conn: &Connection,
        attempts: &[ShardAttempt],
    ) -> Result<Vec<Result<QuerySearchResult>>> {
        let Some(task) = attempts.first().map(|a| a.task) else {
            return Ok(Vec::new());
        };
        let request = NodeQueryRequest {
            shards: attempts.iter().map(|a| self.rewrite(a)).collect(),
        };
        let response = transport
            .execute_batched_query(conn, request, task)
            .await?;
        Ok(response.results)
    }
}

/// Second-stage feature scoring of the top documents.
#[derive(Debug)]
pub struct RankFeaturePhase {
    docs: HashMap<usize, Vec<u32>>,
    contexts: HashMap<usize, ContextId>,
}

impl RankFeaturePhase {
    pub fn new(docs: HashMap<usize, Vec<u32>>, contexts: HashMap<usize, ContextId>) -> Self {
        Self { docs, contexts }
    }
}

#[async_trait]
impl ShardPhase for RankFeaturePhase {
    type Output = RankFeatureResult;

    fn name(&self) -> &'static str {
        "rank_feature"
    }

    async fn execute(
        &self,
        transport: &dyn SearchTransport,
        conn: &Connection,
        attempt: &ShardAttempt,
    ) -> Result<RankFeatureResult> {
        let context_id = context_for(&self.contexts, attempt)?;
        let request = RankFeatureShardRequest {
            shard_id: attempt.shard_id.clone(),
            shard_index: attempt.shard_index,
            context_id,
            doc_ids: self
                .docs
                .get(&attempt.shard_index)
                .cloned()
                .unwrap_or_default(),
        };
        transport
            .execute_rank_feature(conn, request, attempt.task)
            .await
    }
}

/// Loads the documents of the final window.
#[derive(Debug)]
pub struct FetchPhase {
    docs: HashMap<usize, Vec<u32>>,
    contexts: HashMap<usize, ContextId>,
    free_context: bool,
}

impl FetchPhase {
    pub fn new(
        docs: HashMap<usize, Vec<u32>>,
        contexts: HashMap<usize, ContextId>,
        free_context: bool,
    ) -> Self {
        Self {
            docs,
            contexts,
            free_context,
        }
    }
}

#[async_trait]
impl ShardPhase for FetchPhase {
    type Output = FetchSearchResult;

    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn execute(
        &self,
        transport: &dyn SearchTransport,
        conn: &Connection,
        attempt: &ShardAttempt,
    ) -> Result<FetchSearchResult> {
        let context_id = context_for(&self.contexts, attempt)?;
        let request = ShardFetchRequest {
            shard_id: attempt.shard_id.clone(),
            shard_index: attempt.shard_index,
            context_id,
            doc_ids: self
                .docs
                .get(&attempt.shard_index)
                .cloned()
                .unwrap_or_default(),
            free_context: self.free_context,
        };
        transport.execute_fetch(conn, request, attempt.task).await
    }

    fn consumes_context(&self) -> bool {
        self.free_context
    }
}

fn context_for(contexts: &HashMap<usize, ContextId>, attempt: &ShardAttempt) -> Result<ContextId> {
    contexts.get(&attempt.shard_index).cloned().ok_or_else(|| {
        SearchError::Execution(format!(
            "no search context recorded for shard {}",
            attempt.shard_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ScoreDoc;
    use scatter_common::{SearchTarget, ShardId, TaskId};

    fn attempt(shard_index: usize, has_shard_response: bool) -> ShardAttempt {
        ShardAttempt {
            shard_index,
            shard_id: ShardId::new("logs", shard_index as u32),
            target: SearchTarget::remote("eu", "n1"),
            task: TaskId(1),
            has_shard_response,
            num_shards: 3,
        }
    }

    fn template(knn: bool) -> Arc<ShardRequestTemplate> {
        let mut request = SearchRequest::new(["rust"]).with_window(0, 5);
        if knn {
            request = request.with_knn(KnnSearch {
                field: "v".to_string(),
                query_vector: vec![1.0],
                k: 2,
                num_candidates: 4,
            });
        }
        Arc::new(ShardRequestTemplate::from_request(&request, 3))
    }

    #[test]
    fn rewrite_injects_candidates_and_dfs_context() {
        let dfs = Arc::new(AggregatedDfs {
            knn_top: vec![ScoreDoc::new(3, 0.9, 1), ScoreDoc::new(8, 0.8, 2)],
            ..AggregatedDfs::default()
        });
        let phase = QueryPhase::new(template(true))
            .with_dfs(dfs, HashMap::from([(1, ContextId::new("n1", 4))]));
        let request = phase.rewrite(&attempt(1, true));
        assert_eq!(request.candidate_docs, Some(vec![3]));
        assert_eq!(request.context_id, Some(ContextId::new("n1", 4)));
        assert!(request.aggregated_dfs.is_some());
        assert!(request.can_return_null_response_if_match_no_docs);
        assert_eq!(request.cluster_alias.as_deref(), Some("eu"));
        assert_eq!(request.num_shards, 3);
    }

    #[test]
    fn plain_query_rewrite_leaves_request_untouched() {
        let phase = QueryPhase::new(template(false));
        let request = phase.rewrite(&attempt(0, false));
        assert!(request.candidate_docs.is_none());
        assert!(request.aggregated_dfs.is_none());
        assert!(request.context_id.is_none());
        assert!(!request.can_return_null_response_if_match_no_docs);
        assert_eq!(request.size, 5);
    }

    #[test]
    fn missing_context_is_an_execution_error() {
        let err = context_for(&HashMap::new(), &attempt(2, false)).expect_err("missing");
        assert!(matches!(err, SearchError::Execution(_)));
    }
}
