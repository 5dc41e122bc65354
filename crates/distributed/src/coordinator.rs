//! Scatter-gather driver of one search phase.
//!
//! Architecture role:
//! - fans a phase out to every participating shard, one attempt in flight per
//!   shard, moving to the next copy after each failure
//! - buffers successes in a [`ResultSink`] and failures in a [`FailureTracker`]
//! - reaches terminal accounting exactly once and turns it into a verdict:
//!   continue, "all shards failed", or a partial-results violation
//!
//! Accounting: every participating shard expects `max(1, copies)` ops. A
//! failed attempt counts one op, a success counts itself plus every copy that
//! will no longer be tried, a pre-skipped shard counts all of its copies. The
//! phase is done when the running total reaches the expected total.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use scatter_common::{
    CircuitBreaker, NodeId, Result, SearchError, SearchTarget, ShardId, ShardSearchFailure,
    TaskId, global_metrics, group_by_root_cause,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::cancellation::CancellationBridge;
use crate::contexts::ContextLedger;
use crate::failure_tracker::FailureTracker;
use crate::progress::SearchProgressListener;
use crate::result_sink::ResultSink;
use crate::results::PhaseResult;
use crate::shard_iterator::ShardExecutionUnit;
use crate::throttle::{PendingExecutionThrottle, PermitRelease};
use crate::transport::{Connection, SearchTransport};

/// One attempt of one shard against one copy.
#[derive(Debug, Clone)]
pub struct ShardAttempt {
    /// Stable position of the shard within the request.
    pub shard_index: usize,
    pub shard_id: ShardId,
    /// Copy this attempt is sent to.
    pub target: SearchTarget,
    /// Coordinating task, forwarded so remote work can be cancelled by id.
    pub task: TaskId,
    /// Some shard of this phase already answered successfully.
    pub has_shard_response: bool,
    /// Participating shards of this phase.
    pub num_shards: usize,
}

#[async_trait]
/// Per-shard behaviour of one phase.
pub trait ShardPhase: Send + Sync + 'static {
    /// Per-shard result buffered in the phase's [`ResultSink`].
    type Output: PhaseResult;

    /// Phase label used in logs, metrics and phase failures.
    fn name(&self) -> &'static str;

    /// Execute one attempt against the copy behind `conn`.
    ///
    /// Any error settles this attempt only; the coordinator decides whether
    /// the shard moves on to its next copy.
    async fn execute(
        &self,
        transport: &dyn SearchTransport,
        conn: &Connection,
        attempt: &ShardAttempt,
    ) -> Result<Self::Output>;

    /// Whether first attempts on the same node may share one request.
    fn supports_batching(&self) -> bool {
        false
    }

    /// Execute several attempts against one node in one request. The returned
    /// outcomes line up with `attempts`.
    async fn execute_batch(
        &self,
        transport: &dyn SearchTransport,
        conn: &Connection,
        attempts: &[ShardAttempt],
    ) -> Result<Vec<Result<Self::Output>>> {
        let _ = (transport, conn, attempts);
        Err(SearchError::Execution(format!(
            "{} phase does not support batched execution",
            self.name()
        )))
    }

    /// A successful result means the remote already freed the shard's context.
    fn consumes_context(&self) -> bool {
        false
    }
}

/// Per-phase execution options.
#[derive(Debug, Clone, Copy)]
pub struct PhaseOptions {
    /// When false, the first shard to exhaust its copies cancels the request
    /// and the phase fails.
    pub allow_partial_results: bool,
    /// Permits per node; throttling only kicks in above this many shards.
    pub max_concurrent_shard_requests: usize,
    /// Group first attempts per node when the phase supports it.
    pub batched: bool,
}

/// Request-scoped collaborators shared by every phase.
#[derive(Clone)]
pub struct PhaseContext {
    /// Connection lookup and remote dispatch.
    pub transport: Arc<dyn SearchTransport>,
    /// Forwards at most one remote cancel for the request.
    pub bridge: Arc<CancellationBridge>,
    /// Search contexts opened by consumed results.
    pub ledger: Arc<ContextLedger>,
    pub listener: Arc<dyn SearchProgressListener>,
    /// Charged for every buffered shard result.
    pub breaker: Arc<CircuitBreaker>,
    /// Shard count of the whole request; sizes the result sink.
    pub total_shards: usize,
    pub options: PhaseOptions,
}

/// Successful terminal state of a phase.
#[derive(Debug)]
pub struct PhaseOutcome<R> {
    /// Successful results keyed by shard index.
    pub sink: Arc<ResultSink<R>>,
    /// Participating shards of this phase.
    pub num_shards: usize,
    /// Shards that produced a result, skipped shards included.
    pub successful: usize,
    pub skipped: usize,
    /// Non-fatal failures, in shard order.
    pub failures: Vec<ShardSearchFailure>,
    /// Ops counted when the phase settled; equals `expected_total_ops`.
    pub total_ops: usize,
    pub expected_total_ops: usize,
}

impl<R: PhaseResult> PhaseOutcome<R> {
    /// Results in shard-index order.
    pub fn results(&self) -> impl Iterator<Item = (usize, &R)> {
        self.sink.iter()
    }
}

/// Drives one phase over its participating shards.
pub struct PhaseCoordinator<P: ShardPhase> {
    phase: Arc<P>,
    units: Vec<ShardExecutionUnit>,
    ctx: PhaseContext,
}

impl<P: ShardPhase> PhaseCoordinator<P> {
    /// `units` may come in any order; they are driven by shard index.
    pub fn new(phase: P, mut units: Vec<ShardExecutionUnit>, ctx: PhaseContext) -> Self {
        units.sort_by_key(|u| u.shard_index);
        Self {
            phase: Arc::new(phase),
            units,
            ctx,
        }
    }

    /// Run the phase to terminal accounting and return its verdict.
    ///
    /// A client cancel seen while shards are in flight is forwarded to the
    /// remote nodes right away; the phase still waits for every shard to
    /// settle and then fails with [`SearchError::TaskCancelled`].
    pub async fn run(self) -> Result<PhaseOutcome<P::Output>> {
        let name = self.phase.name();
        let started = Instant::now();
        let num_shards = self.units.len();
        let sink = Arc::new(ResultSink::new(
            self.ctx.total_shards,
            Arc::clone(&self.ctx.breaker),
        ));
        if num_shards == 0 {
            info!(
                phase = name,
                operator = "PhaseCoordinator",
                "phase has no participating shards"
            );
            self.ctx.listener.on_phase_done(name, 0, 0);
            return Ok(PhaseOutcome {
                sink,
                num_shards: 0,
                successful: 0,
                skipped: 0,
                failures: Vec::new(),
                total_ops: 0,
                expected_total_ops: 0,
            });
        }

        let expected_total_ops = self.units.iter().map(ShardExecutionUnit::expected_ops).sum();
        let (done_tx, done_rx) = oneshot::channel();
        let throttle = PendingExecutionThrottle::new(
            self.ctx.options.max_concurrent_shard_requests,
            num_shards,
        );
        let shared = Arc::new(PhaseShared {
            phase: self.phase,
            failures: FailureTracker::new(self.ctx.total_shards),
            ctx: self.ctx,
            sink,
            throttle,
            num_shards,
            expected_total_ops,
            successful: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            total_ops: AtomicUsize::new(0),
            has_shard_response: AtomicBool::new(false),
            fatal: OnceLock::new(),
            done_tx: Mutex::new(Some(done_tx)),
        });
        info!(
            phase = name,
            num_shards,
            expected_total_ops,
            throttled = shared.throttle.is_enabled(),
            operator = "PhaseCoordinator",
            "phase started"
        );

        shared.start(self.units);
        let task = Arc::clone(shared.ctx.bridge.task());
        let mut done_rx = done_rx;
        let settled = tokio::select! {
            settled = &mut done_rx => settled,
            () = task.cancelled() => {
                info!(
                    phase = name,
                    task_id = %task.id(),
                    operator = "PhaseCoordinator",
                    "client cancelled the search with shard requests in flight"
                );
                shared.ctx.bridge.propagate_client_cancellation();
                // local accounting still runs to its terminal state
                done_rx.await
            }
        };
        if settled.is_err() {
            return Err(SearchError::Execution(format!(
                "{name} phase ended without terminal accounting"
            )));
        }
        global_metrics().observe_phase_time(name, started.elapsed().as_secs_f64());
        shared.verdict()
    }
}

struct PhaseShared<P: ShardPhase> {
    phase: Arc<P>,
    ctx: PhaseContext,
    sink: Arc<ResultSink<P::Output>>,
    failures: FailureTracker,
    throttle: PendingExecutionThrottle,
    num_shards: usize,
    expected_total_ops: usize,
    successful: AtomicUsize,
    skipped: AtomicUsize,
    total_ops: AtomicUsize,
    has_shard_response: AtomicBool,
    fatal: OnceLock<Arc<SearchError>>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl<P: ShardPhase> PhaseShared<P> {
    fn start(self: &Arc<Self>, units: Vec<ShardExecutionUnit>) {
        let batching = self.ctx.options.batched && self.phase.supports_batching();
        let mut batches: Vec<(SearchTarget, Vec<ShardExecutionUnit>)> = Vec::new();
        for mut unit in units {
            if unit.iterator.skip() {
                self.on_skipped(&unit);
                continue;
            }
            match unit.iterator.next_or_none() {
                None => self.on_no_copies(&unit),
                Some(target) if batching => {
                    match batches.iter_mut().find(|(t, _)| *t == target) {
                        Some((_, group)) => group.push(unit),
                        None => batches.push((target, vec![unit])),
                    }
                }
                Some(target) => {
                    tokio::spawn(Arc::clone(self).drive_shard(unit, target));
                }
            }
        }
        for (target, mut group) in batches {
            if group.len() == 1 {
                if let Some(unit) = group.pop() {
                    tokio::spawn(Arc::clone(self).drive_shard(unit, target));
                }
            } else {
                tokio::spawn(Arc::clone(self).drive_batch(target, group));
            }
        }
    }

    fn attempt_for(&self, unit: &ShardExecutionUnit, target: &SearchTarget) -> ShardAttempt {
        ShardAttempt {
            shard_index: unit.shard_index,
            shard_id: unit.shard_id().clone(),
            target: target.clone(),
            task: self.ctx.bridge.task().id(),
            has_shard_response: self.has_shard_response.load(Ordering::Acquire),
            num_shards: self.num_shards,
        }
    }

    fn cancelled_error(&self) -> Option<SearchError> {
        if !self.ctx.bridge.should_short_circuit() {
            return None;
        }
        self.ctx.bridge.propagate_client_cancellation();
        let reason = self
            .ctx
            .bridge
            .task()
            .reason()
            .unwrap_or("search cancelled after a shard failure")
            .to_string();
        Some(SearchError::TaskCancelled(reason))
    }

    async fn acquire_permit(&self, node: &NodeId) -> PermitRelease {
        if !self.throttle.is_enabled() {
            return PermitRelease::unthrottled();
        }
        let (tx, rx) = oneshot::channel();
        self.throttle.submit(
            node,
            Box::new(move |release| {
                // a dropped receiver hands the permit straight back
                let _ = tx.send(release);
            }),
        );
        rx.await.unwrap_or_else(|_| PermitRelease::unthrottled())
    }

    async fn run_attempt(&self, attempt: &ShardAttempt) -> Result<P::Output> {
        if let Some(e) = self.cancelled_error() {
            return Err(e);
        }
        let conn = self.ctx.transport.connection(&attempt.target)?;
        let _permit = self.acquire_permit(&attempt.target.node).await;
        global_metrics().inc_shard_requests(self.phase.name());
        self.phase
            .execute(self.ctx.transport.as_ref(), &conn, attempt)
            .await
    }

    async fn run_batch(
        &self,
        target: &SearchTarget,
        attempts: &[ShardAttempt],
    ) -> Result<Vec<Result<P::Output>>> {
        if let Some(e) = self.cancelled_error() {
            return Err(e);
        }
        let conn = self.ctx.transport.connection(target)?;
        let _permit = self.acquire_permit(&target.node).await;
        global_metrics().inc_shard_requests(self.phase.name());
        self.phase
            .execute_batch(self.ctx.transport.as_ref(), &conn, attempts)
            .await
    }

    async fn drive_shard(self: Arc<Self>, mut unit: ShardExecutionUnit, first: SearchTarget) {
        let mut target = first;
        loop {
            let attempt = self.attempt_for(&unit, &target);
            match self.run_attempt(&attempt).await {
                Ok(result) => {
                    self.on_shard_result(&unit, result);
                    return;
                }
                Err(e) => match self.on_attempt_failed(&mut unit, target, Arc::new(e)) {
                    Some(next) => target = next,
                    None => return,
                },
            }
        }
    }

    async fn drive_batch(self: Arc<Self>, target: SearchTarget, units: Vec<ShardExecutionUnit>) {
        let attempts: Vec<ShardAttempt> = units
            .iter()
            .map(|u| self.attempt_for(u, &target))
            .collect();
        debug!(
            phase = self.phase.name(),
            target = %target,
            shards = attempts.len(),
            operator = "PhaseCoordinator",
            "dispatching batched shard request"
        );
        match self.run_batch(&target, &attempts).await {
            Ok(results) => {
                let mut results = results.into_iter();
                for unit in units {
                    match results.next() {
                        Some(Ok(result)) => self.on_shard_result(&unit, result),
                        Some(Err(e)) => self.fail_and_continue(unit, target.clone(), Arc::new(e)),
                        None => {
                            let cause = SearchError::Execution(format!(
                                "batched response from [{target}] is missing shard {}",
                                unit.shard_id()
                            ));
                            self.fail_and_continue(unit, target.clone(), Arc::new(cause));
                        }
                    }
                }
            }
            Err(e) => {
                let cause = Arc::new(e);
                for unit in units {
                    self.fail_and_continue(unit, target.clone(), Arc::clone(&cause));
                }
            }
        }
    }

    /// Settle a failed batched attempt and retry the shard on its own.
    fn fail_and_continue(
        self: &Arc<Self>,
        mut unit: ShardExecutionUnit,
        target: SearchTarget,
        cause: Arc<SearchError>,
    ) {
        if let Some(next) = self.on_attempt_failed(&mut unit, target, cause) {
            tokio::spawn(Arc::clone(self).drive_shard(unit, next));
        }
    }

    fn on_skipped(&self, unit: &ShardExecutionUnit) {
        self.successful.fetch_add(1, Ordering::AcqRel);
        self.skipped.fetch_add(1, Ordering::AcqRel);
        self.count_ops(unit.iterator.remaining().max(1));
    }

    fn on_no_copies(&self, unit: &ShardExecutionUnit) {
        let cause = Arc::new(SearchError::NoShardAvailable {
            shard: unit.shard_id().clone(),
            reason: "no copy of the shard is assigned".to_string(),
        });
        self.record_failure(unit, None, Arc::clone(&cause));
        self.on_shard_group_failure(unit.shard_index, &cause);
        self.count_ops(1);
    }

    fn on_shard_result(&self, unit: &ShardExecutionUnit, result: P::Output) {
        let idx = unit.shard_index;
        let remaining = unit.iterator.remaining();
        let target = result.target().clone();
        let context = result.context_id().cloned();
        let consumes = self.phase.consumes_context();
        let ledger = &self.ctx.ledger;
        let consumed = self.sink.consume_result(idx, result, |stored| {
            if consumes {
                ledger.consume(idx);
            } else if let Some(ctx) = stored.context_id() {
                ledger.track(idx, ctx, stored.target());
            }
        });
        match consumed {
            Ok(()) => {
                self.failures.clear(idx);
                self.has_shard_response.store(true, Ordering::Release);
                self.successful.fetch_add(1, Ordering::AcqRel);
                self.ctx.listener.on_shard_result(self.phase.name(), idx);
            }
            Err(e) => {
                // the remote still holds the context of the dropped result
                if let (Some(ctx), false) = (&context, consumes) {
                    ledger.track(idx, ctx, &target);
                }
                let cause = Arc::new(e);
                if matches!(*cause, SearchError::CircuitBreaking { .. }) {
                    let _ = self.fatal.set(Arc::clone(&cause));
                }
                self.record_failure(unit, Some(target), Arc::clone(&cause));
                self.on_shard_group_failure(idx, &cause);
            }
        }
        self.count_ops(remaining + 1);
    }

    /// Returns the next copy to try, or `None` once the shard is settled.
    fn on_attempt_failed(
        &self,
        unit: &mut ShardExecutionUnit,
        target: SearchTarget,
        cause: Arc<SearchError>,
    ) -> Option<SearchTarget> {
        debug!(
            phase = self.phase.name(),
            shard_index = unit.shard_index,
            shard = %unit.shard_id(),
            target = %target,
            error = %cause,
            operator = "PhaseCoordinator",
            "shard attempt failed"
        );
        self.record_failure(unit, Some(target), Arc::clone(&cause));
        match unit.iterator.next_or_none() {
            Some(next) => {
                global_metrics().inc_replica_retries(self.phase.name());
                debug!(
                    phase = self.phase.name(),
                    shard_index = unit.shard_index,
                    next = %next,
                    operator = "PhaseCoordinator",
                    "retrying shard on next copy"
                );
                self.count_ops(1);
                Some(next)
            }
            None => {
                self.on_shard_group_failure(unit.shard_index, &cause);
                self.count_ops(1);
                None
            }
        }
    }

    fn record_failure(
        &self,
        unit: &ShardExecutionUnit,
        target: Option<SearchTarget>,
        cause: Arc<SearchError>,
    ) {
        global_metrics().inc_shard_failures(self.phase.name());
        if self.ctx.bridge.is_self_initiated() && cause.is_task_cancelled() {
            debug!(
                phase = self.phase.name(),
                shard_index = unit.shard_index,
                operator = "PhaseCoordinator",
                "ignoring cancellation failure caused by our own cancel"
            );
            return;
        }
        let failure = ShardSearchFailure::new(
            unit.shard_index,
            Some(unit.shard_id().clone()),
            target,
            cause,
        );
        self.ctx.listener.on_shard_failure(self.phase.name(), &failure);
        self.failures.record(failure);
    }

    fn on_shard_group_failure(&self, shard_index: usize, cause: &SearchError) {
        global_metrics().inc_shard_group_failures(self.phase.name());
        self.ctx
            .listener
            .on_shard_group_failure(self.phase.name(), shard_index, cause);
        if !self.ctx.options.allow_partial_results {
            self.ctx.bridge.cancel_on_partial_failure();
        }
    }

    fn count_ops(&self, ops: usize) {
        let total = self.total_ops.fetch_add(ops, Ordering::AcqRel) + ops;
        if total == self.expected_total_ops {
            self.on_all_shards_accounted();
        } else if total > self.expected_total_ops {
            error!(
                phase = self.phase.name(),
                total_ops = total,
                expected_total_ops = self.expected_total_ops,
                operator = "PhaseCoordinator",
                "phase op accounting overflowed"
            );
            debug_assert!(
                total <= self.expected_total_ops,
                "{} phase counted {total} ops, expected {}",
                self.phase.name(),
                self.expected_total_ops
            );
        }
    }

    fn on_all_shards_accounted(&self) {
        let done = self
            .done_tx
            .lock()
            .expect("phase done lock poisoned")
            .take();
        if let Some(done) = done {
            self.ctx.listener.on_phase_done(
                self.phase.name(),
                self.successful.load(Ordering::Acquire),
                self.num_shards,
            );
            let _ = done.send(());
        }
    }

    fn verdict(&self) -> Result<PhaseOutcome<P::Output>> {
        let name = self.phase.name();
        let successful = self.successful.load(Ordering::Acquire);
        let skipped = self.skipped.load(Ordering::Acquire);
        let failures = self.failures.build_failures();
        info!(
            phase = name,
            num_shards = self.num_shards,
            successful,
            skipped,
            failed = failures.len(),
            operator = "PhaseCoordinator",
            "phase done"
        );

        if let Some(fatal) = self.fatal.get() {
            return Err(SearchError::phase_failure(name, fatal.to_string(), failures));
        }
        let task = self.ctx.bridge.task();
        if task.is_cancelled() {
            self.ctx.bridge.propagate_client_cancellation();
            return Err(SearchError::TaskCancelled(
                task.reason().unwrap_or("cancelled by client").to_string(),
            ));
        }
        if failures.len() == self.num_shards {
            return Err(SearchError::phase_failure(
                name,
                "all shards failed",
                group_by_root_cause(&failures),
            ));
        }
        if !self.ctx.options.allow_partial_results && successful != self.num_shards {
            let message = if failures.is_empty() {
                format!(
                    "Partial shards failure ({} shards unavailable)",
                    self.num_shards - successful
                )
            } else {
                "Partial shards failure".to_string()
            };
            return Err(SearchError::phase_failure(name, message, failures));
        }
        Ok(PhaseOutcome {
            sink: Arc::clone(&self.sink),
            num_shards: self.num_shards,
            successful,
            skipped,
            failures,
            total_ops: self.total_ops.load(Ordering::Acquire),
            expected_total_ops: self.expected_total_ops,
        })
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
