//! Pure reductions of buffered phase results.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::request::KnnSearch;
use crate::results::{
    AggregatedDfs, DfsSearchResult, FetchSearchResult, QuerySearchResult, RankFeatureResult,
    ScoreDoc, SearchHit,
};

/// Global order of hits: score descending, then shard index, then doc.
pub fn compare_score_docs(a: &ScoreDoc, b: &ScoreDoc) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.shard_index.cmp(&b.shard_index))
        .then(a.doc.cmp(&b.doc))
}

/// Sum term statistics and merge kNN candidates into the global top `k`.
pub fn aggregate_dfs<'a, I>(results: I, knn: Option<&KnnSearch>) -> AggregatedDfs
where
    I: IntoIterator<Item = (usize, &'a DfsSearchResult)>,
{
    let mut aggregated = AggregatedDfs::default();
    let mut candidates = Vec::new();
    for (shard_index, result) in results {
        aggregated.max_doc += result.max_doc;
        for (term, stats) in &result.term_stats {
            let entry = aggregated.term_stats.entry(term.clone()).or_default();
            entry.doc_freq += stats.doc_freq;
            entry.total_term_freq += stats.total_term_freq;
        }
        candidates.extend(
            result
                .knn_candidates
                .iter()
                .map(|d| ScoreDoc::new(d.doc, d.score, shard_index)),
        );
    }
    if let Some(knn) = knn {
        candidates.sort_by(compare_score_docs);
        candidates.truncate(knn.k);
        aggregated.knn_top = candidates;
    }
    aggregated
}

/// Merged outcome of the query phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReducedQueryPhase {
    /// Global top `window` hits.
    pub top_docs: Vec<ScoreDoc>,
    pub total_hits: u64,
    pub max_score: Option<f32>,
}

pub fn reduce_query_phase<'a, I>(results: I, window: usize) -> ReducedQueryPhase
where
    I: IntoIterator<Item = (usize, &'a QuerySearchResult)>,
{
    let mut reduced = ReducedQueryPhase::default();
    for (shard_index, result) in results {
        reduced.total_hits += result.total_hits;
        reduced.max_score = match (reduced.max_score, result.max_score) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        reduced.top_docs.extend(
            result
                .top_docs
                .iter()
                .map(|d| ScoreDoc::new(d.doc, d.score, shard_index)),
        );
    }
    reduced.top_docs.sort_by(compare_score_docs);
    reduced.top_docs.truncate(window);
    reduced
}

/// `[from, from + size)` of an ordered hit list.
pub fn page(docs: &[ScoreDoc], from: usize, size: usize) -> Vec<ScoreDoc> {
    docs.iter().skip(from).take(size).copied().collect()
}

/// Order rank-feature rescored documents and cut the requested page.
pub fn rerank<'a, I>(results: I, from: usize, size: usize) -> Vec<ScoreDoc>
where
    I: IntoIterator<Item = (usize, &'a RankFeatureResult)>,
{
    let mut ranked: Vec<ScoreDoc> = results
        .into_iter()
        .flat_map(|(shard_index, result)| {
            result
                .ranked
                .iter()
                .map(move |d| ScoreDoc::new(d.doc, d.score, shard_index))
        })
        .collect();
    ranked.sort_by(compare_score_docs);
    page(&ranked, from, size)
}

/// Doc ids per shard index, in window order.
pub fn docs_to_fetch(window: &[ScoreDoc]) -> BTreeMap<usize, Vec<u32>> {
    let mut by_shard: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
    for doc in window {
        by_shard.entry(doc.shard_index).or_default().push(doc.doc);
    }
    by_shard
}

/// Final hits in window order. Hits of shards without a fetch result are
/// dropped.
pub fn merge_hits<'a, I>(window: &[ScoreDoc], fetched: I) -> Vec<SearchHit>
where
    I: IntoIterator<Item = (usize, &'a FetchSearchResult)>,
{
    let mut by_key: HashMap<(usize, u32), &SearchHit> = HashMap::new();
    for (shard_index, result) in fetched {
        for hit in &result.hits {
            by_key.insert((shard_index, hit.doc), hit);
        }
    }
    window
        .iter()
        .filter_map(|d| {
            by_key.get(&(d.shard_index, d.doc)).map(|hit| SearchHit {
                score: d.score,
                shard_index: d.shard_index,
                ..(*hit).clone()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::TermStatistics;
    use scatter_common::{ContextId, SearchTarget, ShardId};

    fn query_result(docs: &[(u32, f32)], total_hits: u64) -> QuerySearchResult {
        QuerySearchResult {
            shard_id: ShardId::new("logs", 0),
            target: SearchTarget::local("n1"),
            context_id: None,
            top_docs: docs.iter().map(|(d, s)| ScoreDoc::new(*d, *s, 99)).collect(),
            total_hits,
            max_score: docs.first().map(|(_, s)| *s),
        }
    }

    #[test]
    fn query_reduce_orders_by_score_then_shard_then_doc() {
        let a = query_result(&[(1, 2.0), (4, 1.0)], 5);
        let b = query_result(&[(0, 2.0), (2, 1.5)], 3);
        let reduced = reduce_query_phase([(1, &a), (0, &b)], 3);
        let order: Vec<(usize, u32)> = reduced
            .top_docs
            .iter()
            .map(|d| (d.shard_index, d.doc))
            .collect();
        assert_eq!(order, vec![(0, 0), (1, 1), (0, 2)]);
        assert_eq!(reduced.total_hits, 8);
        assert_eq!(reduced.max_score, Some(2.0));
    }

    #[test]
    fn dfs_stats_are_summed_and_knn_cut_to_k() {
        let shard = |df: u64, docs: u64, knn: Vec<ScoreDoc>| DfsSearchResult {
            shard_id: ShardId::new("logs", 0),
            target: SearchTarget::local("n1"),
            context_id: Some(ContextId::new("s", 1)),
            term_stats: BTreeMap::from([(
                "rust".to_string(),
                TermStatistics {
                    doc_freq: df,
                    total_term_freq: df * 2,
                },
            )]),
            max_doc: docs,
            knn_candidates: knn,
        };
        let a = shard(2, 10, vec![ScoreDoc::new(5, 0.9, 0), ScoreDoc::new(6, 0.1, 0)]);
        let b = shard(3, 20, vec![ScoreDoc::new(1, 0.5, 0)]);
        let knn = KnnSearch {
            field: "v".to_string(),
            query_vector: vec![1.0],
            k: 2,
            num_candidates: 2,
        };
        let aggregated = aggregate_dfs([(0, &a), (1, &b)], Some(&knn));
        assert_eq!(aggregated.max_doc, 30);
        assert_eq!(
            aggregated.stats("rust"),
            Some(&TermStatistics {
                doc_freq: 5,
                total_term_freq: 10
            })
        );
        let top: Vec<(usize, u32)> = aggregated
            .knn_top
            .iter()
            .map(|d| (d.shard_index, d.doc))
            .collect();
        assert_eq!(top, vec![(0, 5), (1, 1)]);
    }

    #[test]
    fn merge_drops_hits_of_failed_fetches() {
        let window = vec![
            ScoreDoc::new(3, 3.0, 1),
            ScoreDoc::new(7, 2.0, 0),
            ScoreDoc::new(1, 1.0, 1),
        ];
        let fetched = |shard_index: usize, docs: &[u32]| FetchSearchResult {
            shard_id: ShardId::new("logs", shard_index as u32),
            target: SearchTarget::local("n1"),
            context_id: ContextId::new("s", shard_index as u64),
            hits: docs
                .iter()
                .map(|d| SearchHit {
                    id: format!("doc-{d}"),
                    doc: *d,
                    shard_index,
                    shard_id: None,
                    score: 0.0,
                    source: serde_json::Value::Null,
                })
                .collect(),
        };
        let shard1 = fetched(1, &[3, 1]);
        let hits = merge_hits(&window, [(1, &shard1)]);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-3", "doc-1"]);
        assert_eq!(hits[0].score, 3.0);
        assert_eq!(
            docs_to_fetch(&window),
            BTreeMap::from([(0, vec![7]), (1, vec![3, 1])])
        );
    }

    #[test]
    fn rerank_orders_by_feature_and_pages() {
        let result = |shard_index: usize, docs: &[(u32, f32)]| RankFeatureResult {
            shard_id: ShardId::new("logs", shard_index as u32),
            target: SearchTarget::local("n1"),
            context_id: ContextId::new("s", 1),
            ranked: docs
                .iter()
                .map(|(d, s)| ScoreDoc::new(*d, *s, shard_index))
                .collect(),
        };
        let a = result(0, &[(1, 0.2), (2, 0.9)]);
        let b = result(1, &[(5, 0.5)]);
        let page = rerank([(0, &a), (1, &b)], 1, 5);
        let order: Vec<(usize, u32)> = page.iter().map(|d| (d.shard_index, d.doc)).collect();
        assert_eq!(order, vec![(1, 5), (0, 1)]);
    }
}
