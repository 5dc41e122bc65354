//! In-memory shard executor.
//!
//! Holds a handful of documents per shard, scores them with term frequency
//! times idf (local statistics, or the aggregated dfs statistics when the
//! request carries them) and keeps per-request search contexts. Faults can be
//! scripted per shard and action so coordinator behaviour under failure can be
//! exercised without a network.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scatter_common::{ContextId, NodeId, Result, SearchError, SearchTarget, ShardId};
use serde_json::Value;

use crate::request::{RankFeatureShardRequest, ShardFetchRequest, ShardSearchRequest};
use crate::results::{
    DfsSearchResult, FetchSearchResult, QuerySearchResult, RankFeatureResult, ScoreDoc,
    SearchHit, TermStatistics, idf,
};
use crate::transport::{ShardAction, ShardSearcher};

/// One stored document.
#[derive(Debug, Clone)]
pub struct IndexedDoc {
    pub id: String,
    pub terms: Vec<String>,
    pub vector: Option<Vec<f32>>,
    /// Feature used by the rank-feature phase.
    pub rank_feature: f32,
    pub source: Value,
}

impl IndexedDoc {
    /// Document whose terms are the whitespace-separated lowercase words of `text`.
    pub fn new(id: impl Into<String>, text: &str) -> Self {
        Self {
            id: id.into(),
            terms: text.split_whitespace().map(str::to_lowercase).collect(),
            vector: None,
            rank_feature: 0.0,
            source: Value::String(text.to_string()),
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_rank_feature(mut self, feature: f32) -> Self {
        self.rank_feature = feature;
        self
    }

    pub fn with_source(mut self, source: Value) -> Self {
        self.source = source;
        self
    }

    fn term_freq(&self, term: &str) -> usize {
        self.terms.iter().filter(|t| t.as_str() == term).count()
    }
}

/// Scripted failure of one shard action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The shard raises an execution error.
    Execution(String),
    /// The node does not hold the shard.
    ShardNotFound,
    /// The referenced context is gone.
    ContextMissing,
}

impl Fault {
    fn to_error(&self, shard: &ShardId, context: Option<&ContextId>) -> SearchError {
        match self {
            Self::Execution(msg) => SearchError::ShardExecution(msg.clone()),
            Self::ShardNotFound => SearchError::ShardNotFound {
                shard: shard.clone(),
            },
            Self::ContextMissing => SearchError::ContextMissing(
                context
                    .cloned()
                    .unwrap_or_else(|| ContextId::new("unknown", 0)),
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct OpenContext {
    shard_id: ShardId,
    pinned: bool,
}

/// Shard executor of one node.
pub struct InMemoryShardSearcher {
    node: NodeId,
    session: String,
    shards: HashMap<ShardId, Arc<Vec<IndexedDoc>>>,
    next_context: AtomicU64,
    contexts: Mutex<HashMap<ContextId, OpenContext>>,
    freed: Mutex<Vec<ContextId>>,
    faults: Mutex<HashMap<(ShardId, ShardAction), Fault>>,
    delay: Option<Duration>,
}

impl std::fmt::Debug for InMemoryShardSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryShardSearcher")
            .field("node", &self.node)
            .field("shards", &self.shards.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InMemoryShardSearcher {
    pub fn new(node: impl Into<String>) -> Self {
        let node = NodeId::new(node);
        Self {
            session: format!("{node}-session"),
            node,
            shards: HashMap::new(),
            next_context: AtomicU64::new(1),
            contexts: Mutex::new(HashMap::new()),
            freed: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    pub fn with_shard(mut self, shard_id: ShardId, docs: Vec<IndexedDoc>) -> Self {
        self.shards.insert(shard_id, Arc::new(docs));
        self
    }

    /// Delay every action, e.g. to trip transport timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn inject_fault(&self, shard_id: ShardId, action: ShardAction, fault: Fault) {
        self.faults
            .lock()
            .expect("searcher faults lock poisoned")
            .insert((shard_id, action), fault);
    }

    pub fn clear_faults(&self) {
        self.faults
            .lock()
            .expect("searcher faults lock poisoned")
            .clear();
    }

    pub fn open_contexts(&self) -> usize {
        self.contexts
            .lock()
            .expect("searcher contexts lock poisoned")
            .len()
    }

    pub fn freed_contexts(&self) -> Vec<ContextId> {
        self.freed
            .lock()
            .expect("searcher freed lock poisoned")
            .clone()
    }

    fn target(&self, cluster_alias: Option<String>) -> SearchTarget {
        SearchTarget {
            node: self.node.clone(),
            cluster_alias,
        }
    }

    async fn enter(
        &self,
        shard_id: &ShardId,
        action: ShardAction,
        context: Option<&ContextId>,
    ) -> Result<Arc<Vec<IndexedDoc>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let fault = self
            .faults
            .lock()
            .expect("searcher faults lock poisoned")
            .get(&(shard_id.clone(), action))
            .cloned();
        if let Some(fault) = fault {
            return Err(fault.to_error(shard_id, context));
        }
        self.shards
            .get(shard_id)
            .cloned()
            .ok_or_else(|| SearchError::ShardNotFound {
                shard: shard_id.clone(),
            })
    }

    fn open_context(&self, shard_id: &ShardId, pinned: bool) -> ContextId {
        let id = ContextId::new(
            self.session.clone(),
            self.next_context.fetch_add(1, Ordering::Relaxed),
        );
        self.contexts
            .lock()
            .expect("searcher contexts lock poisoned")
            .insert(
                id.clone(),
                OpenContext {
                    shard_id: shard_id.clone(),
                    pinned,
                },
            );
        id
    }

    fn check_context(&self, context_id: &ContextId, shard_id: &ShardId) -> Result<()> {
        let contexts = self
            .contexts
            .lock()
            .expect("searcher contexts lock poisoned");
        match contexts.get(context_id) {
            Some(ctx) if ctx.shard_id == *shard_id => Ok(()),
            _ => Err(SearchError::ContextMissing(context_id.clone())),
        }
    }

    fn score(docs: &[IndexedDoc], request: &ShardSearchRequest) -> Vec<(u32, f32)> {
        let terms: Vec<String> = request
            .query_terms
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        let idfs: Vec<f32> = terms
            .iter()
            .map(|term| match request.aggregated_dfs.as_ref() {
                Some(dfs) => {
                    let df = dfs.stats(term).map_or(0, |s| s.doc_freq);
                    idf(df, dfs.max_doc)
                }
                None => {
                    let df = docs.iter().filter(|d| d.term_freq(term) > 0).count() as u64;
                    idf(df, docs.len() as u64)
                }
            })
            .collect();
        let candidates: Option<HashSet<u32>> = request
            .candidate_docs
            .as_ref()
            .map(|c| c.iter().copied().collect());
        let knn_vector = request.knn.as_ref().map(|k| k.query_vector.as_slice());

        docs.iter()
            .enumerate()
            .filter_map(|(doc, d)| {
                let doc = doc as u32;
                let mut score: f32 = terms
                    .iter()
                    .zip(&idfs)
                    .map(|(term, idf)| (d.term_freq(term) as f32).sqrt() * idf)
                    .sum();
                let mut matched = score > 0.0;
                if terms.is_empty() && candidates.is_none() {
                    score = 1.0;
                    matched = true;
                }
                if let Some(candidates) = &candidates {
                    if candidates.contains(&doc) {
                        score += similarity(knn_vector, d.vector.as_deref());
                        matched = true;
                    }
                }
                matched.then_some((doc, score))
            })
            .collect()
    }
}

fn similarity(query: Option<&[f32]>, doc: Option<&[f32]>) -> f32 {
    match (query, doc) {
        (Some(q), Some(d)) => {
            let dot: f32 = q.iter().zip(d).map(|(a, b)| a * b).sum();
            // keep scores positive
            (1.0 + dot) / 2.0
        }
        _ => 0.0,
    }
}

fn best_first(a: &ScoreDoc, b: &ScoreDoc) -> std::cmp::Ordering {
    b.score.total_cmp(&a.score).then(a.doc.cmp(&b.doc))
}

#[async_trait]
impl ShardSearcher for InMemoryShardSearcher {
    async fn dfs(&self, request: ShardSearchRequest) -> Result<DfsSearchResult> {
        let docs = self
            .enter(&request.shard_id, ShardAction::Dfs, None)
            .await?;
        let mut term_stats = BTreeMap::new();
        for term in request.query_terms.iter().map(|t| t.to_lowercase()) {
            let doc_freq = docs.iter().filter(|d| d.term_freq(&term) > 0).count() as u64;
            let total_term_freq = docs.iter().map(|d| d.term_freq(&term) as u64).sum();
            term_stats.insert(
                term,
                TermStatistics {
                    doc_freq,
                    total_term_freq,
                },
            );
        }
        let knn_candidates = match &request.knn {
            Some(knn) => {
                let mut scored: Vec<ScoreDoc> = docs
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.vector.is_some())
                    .map(|(doc, d)| {
                        ScoreDoc::new(
                            doc as u32,
                            similarity(Some(&knn.query_vector), d.vector.as_deref()),
                            request.shard_index,
                        )
                    })
                    .collect();
                scored.sort_by(best_first);
                scored.truncate(knn.num_candidates);
                scored
            }
            None => Vec::new(),
        };
        let context_id = match &request.context_id {
            Some(ctx) => {
                self.check_context(ctx, &request.shard_id)?;
                ctx.clone()
            }
            None => self.open_context(&request.shard_id, request.point_in_time),
        };
        Ok(DfsSearchResult {
            shard_id: request.shard_id.clone(),
            target: self.target(request.cluster_alias.clone()),
            context_id: Some(context_id),
            term_stats,
            max_doc: docs.len() as u64,
            knn_candidates,
        })
    }

    async fn query(&self, request: ShardSearchRequest) -> Result<QuerySearchResult> {
        let docs = self
            .enter(
                &request.shard_id,
                ShardAction::Query,
                request.context_id.as_ref(),
            )
            .await?;
        if let Some(ctx) = &request.context_id {
            self.check_context(ctx, &request.shard_id)?;
        }
        let scored = Self::score(&docs, &request);
        let target = self.target(request.cluster_alias.clone());
        if scored.is_empty() && request.can_return_null_response_if_match_no_docs {
            return Ok(QuerySearchResult::empty(request.shard_id.clone(), target));
        }
        let mut top_docs: Vec<ScoreDoc> = scored
            .iter()
            .map(|(doc, score)| ScoreDoc::new(*doc, *score, request.shard_index))
            .collect();
        top_docs.sort_by(best_first);
        let max_score = top_docs.first().map(|d| d.score);
        top_docs.truncate(request.size);
        let context_id = match &request.context_id {
            Some(ctx) => ctx.clone(),
            None => self.open_context(&request.shard_id, request.point_in_time),
        };
        Ok(QuerySearchResult {
            shard_id: request.shard_id.clone(),
            target,
            context_id: Some(context_id),
            top_docs,
            total_hits: scored.len() as u64,
            max_score,
        })
    }

    async fn rank_feature(&self, request: RankFeatureShardRequest) -> Result<RankFeatureResult> {
        let docs = self
            .enter(
                &request.shard_id,
                ShardAction::RankFeature,
                Some(&request.context_id),
            )
            .await?;
        self.check_context(&request.context_id, &request.shard_id)?;
        let ranked = request
            .doc_ids
            .iter()
            .filter_map(|doc| {
                docs.get(*doc as usize)
                    .map(|d| ScoreDoc::new(*doc, d.rank_feature, request.shard_index))
            })
            .collect();
        Ok(RankFeatureResult {
            shard_id: request.shard_id.clone(),
            target: self.target(None),
            context_id: request.context_id.clone(),
            ranked,
        })
    }

    async fn fetch(&self, request: ShardFetchRequest) -> Result<FetchSearchResult> {
        let docs = self
            .enter(&request.shard_id, ShardAction::Fetch, Some(&request.context_id))
            .await?;
        self.check_context(&request.context_id, &request.shard_id)?;
        let hits = request
            .doc_ids
            .iter()
            .filter_map(|doc| {
                docs.get(*doc as usize).map(|d| SearchHit {
                    id: d.id.clone(),
                    doc: *doc,
                    shard_index: request.shard_index,
                    shard_id: Some(request.shard_id.clone()),
                    score: 0.0,
                    source: d.source.clone(),
                })
            })
            .collect();
        if request.free_context {
            self.free_context(&request.context_id);
        }
        Ok(FetchSearchResult {
            shard_id: request.shard_id.clone(),
            target: self.target(None),
            context_id: request.context_id.clone(),
            hits,
        })
    }

    fn free_context(&self, context_id: &ContextId) -> bool {
        let removed = {
            let mut contexts = self
                .contexts
                .lock()
                .expect("searcher contexts lock poisoned");
            match contexts.get(context_id) {
                Some(ctx) if ctx.pinned => false,
                Some(_) => contexts.remove(context_id).is_some(),
                None => false,
            }
        };
        if removed {
            self.freed
                .lock()
                .expect("searcher freed lock poisoned")
                .push(context_id.clone());
        }
        removed
    }
}
