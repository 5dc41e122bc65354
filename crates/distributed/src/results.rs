//! Per-shard phase results and the aggregated dfs statistics.

use std::collections::BTreeMap;
use std::mem::size_of;

use scatter_common::{ContextId, SearchTarget, ShardId};
use serde::{Deserialize, Serialize};

/// Common surface of every per-shard phase result held by a [`crate::ResultSink`].
pub trait PhaseResult: Send + Sync + 'static {
    /// Copy that produced the result.
    fn target(&self) -> &SearchTarget;
    /// Server-side context the result keeps open, if any.
    fn context_id(&self) -> Option<&ContextId>;
    /// Bytes charged against the request circuit breaker while buffered.
    fn estimated_size_bytes(&self) -> usize;
}

/// One scored document of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreDoc {
    pub doc: u32,
    pub score: f32,
    pub shard_index: usize,
}

impl ScoreDoc {
    pub fn new(doc: u32, score: f32, shard_index: usize) -> Self {
        Self {
            doc,
            score,
            shard_index,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermStatistics {
    pub doc_freq: u64,
    pub total_term_freq: u64,
}

#[derive(Debug, Clone)]
pub struct DfsSearchResult {
    pub shard_id: ShardId,
    pub target: SearchTarget,
    pub context_id: Option<ContextId>,
    pub term_stats: BTreeMap<String, TermStatistics>,
    pub max_doc: u64,
    /// Local kNN candidates, best first.
    pub knn_candidates: Vec<ScoreDoc>,
}

impl PhaseResult for DfsSearchResult {
    fn target(&self) -> &SearchTarget {
        &self.target
    }

    fn context_id(&self) -> Option<&ContextId> {
        self.context_id.as_ref()
    }

    fn estimated_size_bytes(&self) -> usize {
        let terms: usize = self
            .term_stats
            .keys()
            .map(|t| t.len() + size_of::<TermStatistics>())
            .sum();
        size_of::<Self>() + terms + self.knn_candidates.len() * size_of::<ScoreDoc>()
    }
}

#[derive(Debug, Clone)]
pub struct QuerySearchResult {
    pub shard_id: ShardId,
    pub target: SearchTarget,
    /// `None` when the shard answered "no match" without keeping state.
    pub context_id: Option<ContextId>,
    /// Local top hits, best first.
    pub top_docs: Vec<ScoreDoc>,
    pub total_hits: u64,
    pub max_score: Option<f32>,
}

impl QuerySearchResult {
    /// Result of a shard that matched nothing and kept no context.
    pub fn empty(shard_id: ShardId, target: SearchTarget) -> Self {
        Self {
            shard_id,
            target,
            context_id: None,
            top_docs: Vec::new(),
            total_hits: 0,
            max_score: None,
        }
    }
}

impl PhaseResult for QuerySearchResult {
    fn target(&self) -> &SearchTarget {
        &self.target
    }

    fn context_id(&self) -> Option<&ContextId> {
        self.context_id.as_ref()
    }

    fn estimated_size_bytes(&self) -> usize {
        size_of::<Self>() + self.top_docs.len() * size_of::<ScoreDoc>()
    }
}

#[derive(Debug, Clone)]
pub struct RankFeatureResult {
    pub shard_id: ShardId,
    pub target: SearchTarget,
    pub context_id: ContextId,
    /// Rescored documents of the requested doc ids.
    pub ranked: Vec<ScoreDoc>,
}

impl PhaseResult for RankFeatureResult {
    fn target(&self) -> &SearchTarget {
        &self.target
    }

    fn context_id(&self) -> Option<&ContextId> {
        Some(&self.context_id)
    }

    fn estimated_size_bytes(&self) -> usize {
        size_of::<Self>() + self.ranked.len() * size_of::<ScoreDoc>()
    }
}

/// One fetched document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub doc: u32,
    pub shard_index: usize,
    pub shard_id: Option<ShardId>,
    pub score: f32,
    pub source: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct FetchSearchResult {
    pub shard_id: ShardId,
    pub target: SearchTarget,
    pub context_id: ContextId,
    pub hits: Vec<SearchHit>,
}

impl PhaseResult for FetchSearchResult {
    fn target(&self) -> &SearchTarget {
        &self.target
    }

    fn context_id(&self) -> Option<&ContextId> {
        Some(&self.context_id)
    }

    fn estimated_size_bytes(&self) -> usize {
        size_of::<Self>()
            + self
                .hits
                .iter()
                .map(|h| size_of::<SearchHit>() + h.id.len() + h.source.to_string().len())
                .sum::<usize>()
    }
}

/// Global term statistics merged from every dfs result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedDfs {
    pub term_stats: BTreeMap<String, TermStatistics>,
    pub max_doc: u64,
    /// Global kNN top-k, best first.
    pub knn_top: Vec<ScoreDoc>,
}

impl AggregatedDfs {
    pub fn stats(&self, term: &str) -> Option<&TermStatistics> {
        self.term_stats.get(term)
    }

    /// kNN candidate documents belonging to one shard.
    pub fn knn_docs_for(&self, shard_index: usize) -> Vec<u32> {
        self.knn_top
            .iter()
            .filter(|d| d.shard_index == shard_index)
            .map(|d| d.doc)
            .collect()
    }
}

/// Okapi-style inverse document frequency.
pub fn idf(doc_freq: u64, max_doc: u64) -> f32 {
    let df = doc_freq as f64;
    let n = max_doc as f64;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln() as f32
}
