//! Phase pipeline of one search request.
//!
//! dfs (optional) → query → rank-feature (optional) → fetch. Every phase is a
//! fresh [`PhaseCoordinator`]; later phases only involve the shards that hold
//! documents still relevant, and go back to the copy that holds the shard's
//! search context.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use scatter_common::{
    CircuitBreaker, ContextId, CoordinatorConfig, Result, SearchError, SearchTarget, ShardId,
    ShardSearchFailure,
};
use tracing::{info, warn};

use crate::cancellation::{CancellationBridge, SearchTask};
use crate::contexts::ContextLedger;
use crate::coordinator::{PhaseContext, PhaseCoordinator, PhaseOptions, PhaseOutcome, ShardPhase};
use crate::phases::{DfsPhase, FetchPhase, QueryPhase, RankFeaturePhase, ShardRequestTemplate};
use crate::progress::{NoopProgressListener, SearchProgressListener};
use crate::reduce::{aggregate_dfs, docs_to_fetch, merge_hits, page, reduce_query_phase, rerank};
use crate::request::{SearchRequest, SearchType};
use crate::response::{SearchResponse, ShardStats};
use crate::results::{PhaseResult, QuerySearchResult, SearchHit};
use crate::shard_iterator::{ShardExecutionUnit, ShardIterator, assign_shard_indices};
use crate::topology::TopologyResolver;
use crate::transport::SearchTransport;

/// Entry point of a search: resolves the topology and drives every phase.
pub struct SearchAction {
    transport: Arc<dyn SearchTransport>,
    topology: Arc<dyn TopologyResolver>,
    config: CoordinatorConfig,
    breaker: Arc<CircuitBreaker>,
    listener: Arc<dyn SearchProgressListener>,
}

impl SearchAction {
    pub fn new(
        transport: Arc<dyn SearchTransport>,
        topology: Arc<dyn TopologyResolver>,
        config: CoordinatorConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new("request", config.request_breaker_limit_bytes);
        Self {
            transport,
            topology,
            config,
            breaker,
            listener: Arc::new(NoopProgressListener),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn SearchProgressListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `request` to a single terminal outcome.
    pub async fn execute(
        &self,
        request: SearchRequest,
        task: Arc<SearchTask>,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        request.validate(&self.config)?;
        let units = assign_shard_indices(self.topology.resolve(&request)?);
        let total_shards = units.len();
        let pit_id = request.point_in_time.as_ref().map(|p| p.id.clone());
        info!(
            task_id = %task.id(),
            num_shards = total_shards,
            search_type = ?request.effective_search_type(),
            operator = "SearchAction",
            "search started"
        );
        self.listener.on_list_shards(&units);
        if total_shards == 0 {
            return Ok(SearchResponse::empty(elapsed_ms(started), pit_id));
        }

        let bridge = Arc::new(CancellationBridge::new(
            Arc::clone(&task),
            Arc::clone(&self.transport),
        ));
        let ledger = Arc::new(ContextLedger::new(
            Arc::clone(&self.transport),
            request.point_in_time.is_some(),
        ));
        let ctx = PhaseContext {
            transport: Arc::clone(&self.transport),
            bridge: Arc::clone(&bridge),
            ledger: Arc::clone(&ledger),
            listener: Arc::clone(&self.listener),
            breaker: Arc::clone(&self.breaker),
            total_shards,
            options: PhaseOptions {
                allow_partial_results: request.allow_partial_results(&self.config),
                max_concurrent_shard_requests: request.max_concurrent_requests(&self.config),
                batched: self.config.batched_query_phase,
            },
        };
        let mut run = SearchRun {
            request: &request,
            ctx,
            failures: BTreeMap::new(),
            skipped: 0,
        };
        let outcome = run.execute(units).await;
        let released = ledger.release_all("request");
        match outcome {
            Ok(reduced) => {
                let failed = run.failures.len();
                let response = SearchResponse {
                    hits: reduced.hits,
                    total_hits: reduced.total_hits,
                    max_score: reduced.max_score,
                    shards: ShardStats {
                        total: total_shards,
                        successful: total_shards - failed,
                        skipped: run.skipped,
                        failed,
                    },
                    shard_failures: run.failures.into_values().collect(),
                    took_ms: elapsed_ms(started),
                    point_in_time_id: pit_id,
                };
                info!(
                    task_id = %task.id(),
                    hits = response.hits.len(),
                    successful = response.shards.successful,
                    failed,
                    released_contexts = released,
                    took_ms = response.took_ms,
                    operator = "SearchAction",
                    "search completed"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(
                    task_id = %task.id(),
                    error = %e,
                    status = e.status(),
                    released_contexts = released,
                    operator = "SearchAction",
                    "search failed"
                );
                Err(e)
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Hits and totals after the last phase.
struct ReducedSearch {
    hits: Vec<SearchHit>,
    total_hits: u64,
    max_score: Option<f32>,
}

/// Mutable state of one request across its phases.
struct SearchRun<'a> {
    request: &'a SearchRequest,
    ctx: PhaseContext,
    /// First informative failure per shard index, across phases.
    failures: BTreeMap<usize, ShardSearchFailure>,
    skipped: usize,
}

impl SearchRun<'_> {
    async fn execute(&mut self, units: Vec<ShardExecutionUnit>) -> Result<ReducedSearch> {
        let request = self.request;
        let template = Arc::new(ShardRequestTemplate::from_request(
            request,
            self.ctx.total_shards,
        ));
        let batched = self.ctx.options.batched;

        let query = match request.effective_search_type() {
            SearchType::QueryThenFetch => {
                let phase = QueryPhase::new(Arc::clone(&template)).with_batching(batched);
                self.run_phase(phase, units).await?
            }
            SearchType::DfsQueryThenFetch => {
                let dfs = self.run_phase(DfsPhase::new(Arc::clone(&template)), units).await?;
                let aggregated = Arc::new(aggregate_dfs(dfs.results(), request.knn.as_ref()));
                let contexts: HashMap<usize, ContextId> = dfs
                    .results()
                    .filter_map(|(idx, r)| r.context_id.clone().map(|c| (idx, c)))
                    .collect();
                let query_units = dfs
                    .results()
                    .map(|(idx, r)| single_copy_unit(idx, &r.shard_id, r.target()))
                    .collect();
                dfs.sink.release();
                let phase = QueryPhase::new(Arc::clone(&template))
                    .with_dfs(aggregated, contexts)
                    .with_batching(batched);
                self.run_phase(phase, query_units).await?
            }
        };

        let reduced = reduce_query_phase(query.results(), request.query_window());
        let query_results: HashMap<usize, &QuerySearchResult> = query.results().collect();

        let window = match request.rank_window_size {
            Some(rank_window) => {
                let candidates = page(&reduced.top_docs, 0, rank_window);
                let by_shard = docs_to_fetch(&candidates);
                let (units, contexts) = later_phase_units(&by_shard, &query_results);
                let docs = by_shard.into_iter().collect();
                let ranked = self
                    .run_phase(RankFeaturePhase::new(docs, contexts), units)
                    .await?;
                let window = rerank(ranked.results(), request.from, request.size);
                ranked.sink.release();
                window
            }
            None => page(&reduced.top_docs, request.from, request.size),
        };

        let by_shard = docs_to_fetch(&window);
        let keep: BTreeSet<usize> = by_shard.keys().copied().collect();
        self.ctx.ledger.release_except(&keep, "query");
        let fetch_plan =
            (!by_shard.is_empty()).then(|| later_phase_units(&by_shard, &query_results));
        // query results are not read past this point
        query.sink.release();
        let hits = if let Some((units, contexts)) = fetch_plan {
            let docs = by_shard.into_iter().collect();
            let free_context = request.point_in_time.is_none();
            let fetched = self
                .run_phase(FetchPhase::new(docs, contexts, free_context), units)
                .await?;
            let hits = merge_hits(&window, fetched.results());
            fetched.sink.release();
            hits
        } else {
            Vec::new()
        };

        Ok(ReducedSearch {
            hits,
            total_hits: reduced.total_hits,
            max_score: reduced.max_score,
        })
    }

    async fn run_phase<P: ShardPhase>(
        &mut self,
        phase: P,
        units: Vec<ShardExecutionUnit>,
    ) -> Result<PhaseOutcome<P::Output>> {
        let name = phase.name();
        let task = self.ctx.bridge.task();
        if task.is_cancelled() {
            self.ctx.bridge.propagate_client_cancellation();
            return Err(SearchError::TaskCancelled(
                task.reason().unwrap_or("cancelled by client").to_string(),
            ));
        }
        let outcome = PhaseCoordinator::new(phase, units, self.ctx.clone())
            .run()
            .await
            .map_err(|e| into_phase_failure(name, e))?;
        self.skipped += outcome.skipped;
        for failure in &outcome.failures {
            match self.failures.get(&failure.shard_index) {
                Some(existing)
                    if !existing.cause.is_shard_not_available()
                        || failure.cause.is_shard_not_available() => {}
                _ => {
                    self.failures.insert(failure.shard_index, failure.clone());
                }
            }
        }
        Ok(outcome)
    }
}

/// Units and contexts of a later phase over the shards in `by_shard`.
///
/// Each unit has exactly one copy: the node that answered the query phase.
fn later_phase_units(
    by_shard: &BTreeMap<usize, Vec<u32>>,
    query_results: &HashMap<usize, &QuerySearchResult>,
) -> (Vec<ShardExecutionUnit>, HashMap<usize, ContextId>) {
    let mut units = Vec::with_capacity(by_shard.len());
    let mut contexts = HashMap::with_capacity(by_shard.len());
    for idx in by_shard.keys() {
        let Some(result) = query_results.get(idx) else {
            continue;
        };
        let Some(context_id) = result.context_id.clone() else {
            warn!(
                shard_index = *idx,
                shard = %result.shard_id,
                operator = "SearchAction",
                "query result with hits carries no search context"
            );
            continue;
        };
        contexts.insert(*idx, context_id);
        units.push(single_copy_unit(*idx, &result.shard_id, result.target()));
    }
    (units, contexts)
}

fn single_copy_unit(shard_index: usize, shard_id: &ShardId, target: &SearchTarget) -> ShardExecutionUnit {
    ShardExecutionUnit::new(
        shard_index,
        ShardIterator::single(shard_id.clone(), target.clone()),
    )
}

/// Errors raised outside shard accounting surface as a phase failure with no
/// shard detail.
fn into_phase_failure(phase: &str, e: SearchError) -> SearchError {
    match e {
        SearchError::SearchPhaseExecution { .. } | SearchError::TaskCancelled(_) => e,
        other => SearchError::phase_failure(phase, other.to_string(), Vec::new()),
    }
}
