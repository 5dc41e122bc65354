use super::*;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use scatter_common::ContextId;

use crate::cancellation::SearchTask;
use crate::progress::NoopProgressListener;
use crate::results::QuerySearchResult;
use crate::searcher::InMemoryShardSearcher;
use crate::shard_iterator::ShardIterator;
use crate::transport::InProcessTransport;

/// Scripted outcome of one attempt of one shard on one node.
#[derive(Debug, Clone, Copy)]
enum Step {
    Ok,
    Context(u64),
    NotAvailable,
    Fail(&'static str),
    RemoteCancelled,
}

#[derive(Default)]
struct Script {
    steps: HashMap<(usize, &'static str), Step>,
    delays: HashMap<(usize, &'static str), Duration>,
    batching: bool,
    batch_timeout: bool,
    calls: Mutex<Vec<(usize, String)>>,
    batch_calls: Mutex<Vec<(String, Vec<usize>)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Script {
    fn step(mut self, shard_index: usize, node: &'static str, step: Step) -> Self {
        self.steps.insert((shard_index, node), step);
        self
    }

    fn delay(mut self, shard_index: usize, node: &'static str, delay: Duration) -> Self {
        self.delays.insert((shard_index, node), delay);
        self
    }

    fn batched(mut self) -> Self {
        self.batching = true;
        self
    }

    fn calls(&self) -> Vec<(usize, String)> {
        self.calls.lock().expect("calls").clone()
    }

    fn outcome(&self, attempt: &ShardAttempt) -> Result<QuerySearchResult> {
        let node = attempt.target.node.as_str();
        let step = self
            .steps
            .iter()
            .find(|((idx, n), _)| *idx == attempt.shard_index && *n == node)
            .map_or(Step::Ok, |(_, step)| *step);
        let remote = |cause| SearchError::remote(attempt.target.node.clone(), "query", cause);
        match step {
            Step::Ok => Ok(QuerySearchResult::empty(
                attempt.shard_id.clone(),
                attempt.target.clone(),
            )),
            Step::Context(id) => Ok(QuerySearchResult {
                context_id: Some(ContextId::new(node, id)),
                ..QuerySearchResult::empty(attempt.shard_id.clone(), attempt.target.clone())
            }),
            Step::NotAvailable => Err(SearchError::ShardNotFound {
                shard: attempt.shard_id.clone(),
            }),
            Step::Fail(msg) => Err(remote(SearchError::ShardExecution(msg.to_string()))),
            Step::RemoteCancelled => Err(remote(SearchError::TaskCancelled(
                "parent task cancelled".to_string(),
            ))),
        }
    }
}

struct ScriptedPhase(Arc<Script>);

#[async_trait]
impl ShardPhase for ScriptedPhase {
    type Output = QuerySearchResult;

    fn name(&self) -> &'static str {
        "query"
    }

    async fn execute(
        &self,
        _transport: &dyn SearchTransport,
        _conn: &Connection,
        attempt: &ShardAttempt,
    ) -> Result<QuerySearchResult> {
        let script = &self.0;
        let node = attempt.target.node.as_str().to_string();
        script
            .calls
            .lock()
            .expect("calls")
            .push((attempt.shard_index, node.clone()));
        let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = script
            .delays
            .iter()
            .find(|((idx, n), _)| *idx == attempt.shard_index && *n == node)
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        script.in_flight.fetch_sub(1, Ordering::SeqCst);
        script.outcome(attempt)
    }

    fn supports_batching(&self) -> bool {
        self.0.batching
    }

    async fn execute_batch(
        &self,
        _transport: &dyn SearchTransport,
        conn: &Connection,
        attempts: &[ShardAttempt],
    ) -> Result<Vec<Result<QuerySearchResult>>> {
        let script = &self.0;
        script.batch_calls.lock().expect("batch calls").push((
            conn.node().as_str().to_string(),
            attempts.iter().map(|a| a.shard_index).collect(),
        ));
        if script.batch_timeout {
            return Err(SearchError::Timeout {
                node: conn.node().clone(),
                timeout_ms: 50,
            });
        }
        Ok(attempts.iter().map(|a| script.outcome(a)).collect())
    }
}

struct Harness {
    transport: Arc<InProcessTransport>,
    task: Arc<SearchTask>,
    ctx: PhaseContext,
}

fn harness(nodes: &[&str], total_shards: usize, options: PhaseOptions) -> Harness {
    harness_with_breaker(nodes, total_shards, options, CircuitBreaker::unlimited("request"))
}

fn harness_with_breaker(
    nodes: &[&str],
    total_shards: usize,
    options: PhaseOptions,
    breaker: Arc<CircuitBreaker>,
) -> Harness {
    let transport = Arc::new(nodes.iter().fold(InProcessTransport::new(), |t, node| {
        t.with_node(
            SearchTarget::local(*node),
            Arc::new(InMemoryShardSearcher::new(*node)),
        )
    }));
    let task = SearchTask::new(TaskId(42));
    let ctx = PhaseContext {
        transport: transport.clone(),
        bridge: Arc::new(CancellationBridge::new(Arc::clone(&task), transport.clone())),
        ledger: Arc::new(ContextLedger::new(transport.clone(), false)),
        listener: Arc::new(NoopProgressListener),
        breaker,
        total_shards,
        options,
    };
    Harness {
        transport,
        task,
        ctx,
    }
}

fn options(allow_partial_results: bool) -> PhaseOptions {
    PhaseOptions {
        allow_partial_results,
        max_concurrent_shard_requests: 100,
        batched: false,
    }
}

fn unit(shard_index: usize, nodes: &[&str]) -> ShardExecutionUnit {
    ShardExecutionUnit::new(
        shard_index,
        ShardIterator::new(
            ShardId::new("logs", shard_index as u32),
            nodes.iter().map(|n| SearchTarget::local(*n)).collect(),
        ),
    )
}

async fn run(
    script: &Arc<Script>,
    units: Vec<ShardExecutionUnit>,
    ctx: PhaseContext,
) -> Result<PhaseOutcome<QuerySearchResult>> {
    PhaseCoordinator::new(ScriptedPhase(Arc::clone(script)), units, ctx)
        .run()
        .await
}

fn failed_indices(failures: &[ShardSearchFailure]) -> Vec<usize> {
    failures.iter().map(|f| f.shard_index).collect()
}

#[tokio::test]
async fn retries_every_copy_before_failing_the_shard() {
    let script = Arc::new(
        Script::default()
            .step(0, "n1", Step::Fail("n1 down"))
            .step(0, "n2", Step::Fail("n2 down"))
            .step(0, "n3", Step::Fail("n3 down")),
    );
    let h = harness(&["n1", "n2", "n3"], 2, options(true));
    let outcome = run(
        &script,
        vec![unit(0, &["n1", "n2", "n3"]), unit(1, &["n1"])],
        h.ctx,
    )
    .await
    .expect("partial results allowed");

    let shard0: Vec<String> = script
        .calls()
        .into_iter()
        .filter(|(idx, _)| *idx == 0)
        .map(|(_, node)| node)
        .collect();
    assert_eq!(shard0, vec!["n1", "n2", "n3"]);
    assert_eq!(outcome.successful, 1);
    assert_eq!(failed_indices(&outcome.failures), vec![0]);
    assert!(outcome.failures[0].reason().contains("n1 down"));
    assert_eq!(outcome.total_ops, 4);
    assert_eq!(outcome.expected_total_ops, 4);
    assert!(outcome.sink.has_result(1));
}

#[tokio::test]
async fn success_on_a_replica_clears_the_earlier_failure() {
    let script = Arc::new(Script::default().step(0, "n1", Step::Fail("flaky")));
    let h = harness(&["n1", "n2"], 1, options(false));
    let outcome = run(&script, vec![unit(0, &["n1", "n2", "n3"])], h.ctx)
        .await
        .expect("replica answered");
    assert_eq!(outcome.successful, 1);
    assert!(outcome.failures.is_empty());
    // success on the second copy accounts for the untried third copy too
    assert_eq!(outcome.total_ops, 3);
    assert_eq!(outcome.expected_total_ops, 3);
    assert_eq!(script.calls().len(), 2);
}

#[tokio::test]
async fn informative_failure_supersedes_not_available() {
    let script = Arc::new(
        Script::default()
            .step(0, "n1", Step::NotAvailable)
            .step(0, "n2", Step::Fail("disk full")),
    );
    let h = harness(&["n1", "n2"], 2, options(true));
    let outcome = run(&script, vec![unit(0, &["n1", "n2"]), unit(1, &["n1"])], h.ctx)
        .await
        .expect("partial results allowed");
    assert_eq!(failed_indices(&outcome.failures), vec![0]);
    assert!(!outcome.failures[0].cause.is_shard_not_available());
    assert!(outcome.failures[0].reason().contains("disk full"));
}

#[tokio::test]
async fn every_shard_failing_is_all_shards_failed_grouped_by_cause() {
    let script = Arc::new(
        Script::default()
            .step(0, "n1", Step::Fail("boom"))
            .step(1, "n1", Step::Fail("boom"))
            .step(2, "n1", Step::NotAvailable),
    );
    let h = harness(&["n1"], 3, options(true));
    let err = run(
        &script,
        vec![unit(0, &["n1"]), unit(1, &["n1"]), unit(2, &["n1"])],
        h.ctx,
    )
    .await
    .expect_err("nothing succeeded");
    match err {
        SearchError::SearchPhaseExecution {
            phase,
            message,
            shard_failures,
        } => {
            assert_eq!(phase, "query");
            assert_eq!(message, "all shards failed");
            assert_eq!(shard_failures.len(), 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn skipped_shard_is_successful_without_dispatch() {
    let script = Arc::new(Script::default());
    let h = harness(&["n1", "n2"], 2, options(false));
    let skipped = ShardExecutionUnit::new(
        0,
        ShardIterator::new(
            ShardId::new("logs", 0),
            vec![SearchTarget::local("n1"), SearchTarget::local("n2")],
        )
        .with_skip(true),
    );
    let outcome = run(&script, vec![skipped, unit(1, &["n2"])], h.ctx)
        .await
        .expect("skip is not a failure");
    assert_eq!(outcome.successful, 2);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(script.calls(), vec![(1, "n2".to_string())]);
    assert_eq!(outcome.total_ops, 3);
    assert_eq!(outcome.expected_total_ops, 3);
    assert!(!outcome.sink.has_result(0));
}

#[tokio::test]
async fn empty_phase_completes_immediately() {
    let script = Arc::new(Script::default());
    let h = harness(&["n1"], 0, options(false));
    let outcome = run(&script, Vec::new(), h.ctx).await.expect("empty");
    assert_eq!(outcome.num_shards, 0);
    assert_eq!(outcome.successful, 0);
    assert!(script.calls().is_empty());
}

#[tokio::test]
async fn shard_without_copies_fails_as_unavailable() {
    let script = Arc::new(Script::default());
    let h = harness(&["n1"], 2, options(true));
    let outcome = run(&script, vec![unit(0, &[]), unit(1, &["n1"])], h.ctx)
        .await
        .expect("partial results allowed");
    assert_eq!(failed_indices(&outcome.failures), vec![0]);
    assert!(outcome.failures[0].cause.is_shard_not_available());
    assert_eq!(outcome.total_ops, 2);
}

#[tokio::test]
async fn unreachable_node_moves_to_the_next_copy() {
    let script = Arc::new(Script::default());
    // n1 is not registered with the transport
    let h = harness(&["n2"], 1, options(false));
    let outcome = run(&script, vec![unit(0, &["n1", "n2"])], h.ctx)
        .await
        .expect("second copy reachable");
    assert_eq!(outcome.successful, 1);
    assert_eq!(script.calls(), vec![(0, "n2".to_string())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disallowed_partial_results_cancel_once_and_fail_the_phase() {
    let mut script = Script::default();
    for idx in 0..4 {
        script = script.step(idx, "n1", Step::Fail("boom"));
    }
    for idx in 4..8 {
        script = script.delay(idx, "n1", Duration::from_millis(20));
    }
    let script = Arc::new(script);
    let h = harness(&["n1"], 8, options(false));
    let bridge = Arc::clone(&h.ctx.bridge);
    let units = (0..8).map(|idx| unit(idx, &["n1"])).collect();
    let err = run(&script, units, h.ctx).await.expect_err("partial failure");
    match err {
        SearchError::SearchPhaseExecution {
            message,
            shard_failures,
            ..
        } => {
            assert_eq!(message, "Partial shards failure");
            assert!(!shard_failures.is_empty());
            assert!(shard_failures.iter().all(|f| !f.cause.is_task_cancelled()));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(h.transport.cancel_calls().len(), 1);
    assert!(bridge.is_self_initiated());
}

#[tokio::test]
async fn own_cancellation_is_not_reported_as_a_shard_failure() {
    // shard 0 is in flight when shard 1 fails and triggers the cancel
    let script = Arc::new(
        Script::default()
            .delay(0, "n1", Duration::from_millis(30))
            .step(0, "n1", Step::RemoteCancelled)
            .step(1, "n1", Step::Fail("boom")),
    );
    let h = harness(&["n1"], 2, options(false));
    let err = run(&script, vec![unit(0, &["n1"]), unit(1, &["n1"])], h.ctx)
        .await
        .expect_err("partial failure");
    match err {
        SearchError::SearchPhaseExecution { shard_failures, .. } => {
            assert_eq!(failed_indices(&shard_failures), vec![1]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(script.calls().len(), 2);
    assert_eq!(h.transport.cancel_calls().len(), 1);
}

#[tokio::test]
async fn attempts_after_own_cancellation_are_not_dispatched() {
    let script = Arc::new(
        Script::default()
            .delay(0, "n1", Duration::from_millis(30))
            .step(0, "n1", Step::Fail("slow copy"))
            .step(1, "n1", Step::Fail("boom")),
    );
    let h = harness(&["n1", "n2"], 2, options(false));
    let err = run(&script, vec![unit(0, &["n1", "n2"]), unit(1, &["n1"])], h.ctx)
        .await
        .expect_err("partial failure");
    assert!(matches!(err, SearchError::SearchPhaseExecution { .. }));
    assert!(!script.calls().contains(&(0, "n2".to_string())));
}

#[tokio::test]
async fn client_cancellation_short_circuits_and_surfaces_task_cancelled() {
    let script = Arc::new(Script::default());
    let h = harness(&["n1"], 2, options(true));
    h.task.cancel("user closed the connection");
    let err = run(&script, vec![unit(0, &["n1"]), unit(1, &["n1"])], h.ctx)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, SearchError::TaskCancelled(ref r) if r == "user closed the connection"));
    assert!(script.calls().is_empty());
    let cancels = h.transport.cancel_calls();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].1, "user closed the connection");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_cancel_while_in_flight_is_forwarded_before_shards_settle() {
    let script = Arc::new(
        Script::default()
            .delay(0, "n1", Duration::from_millis(200))
            .delay(1, "n1", Duration::from_millis(200)),
    );
    let h = harness(&["n1"], 2, options(true));
    let phase = tokio::spawn(
        PhaseCoordinator::new(
            ScriptedPhase(Arc::clone(&script)),
            vec![unit(0, &["n1"]), unit(1, &["n1"])],
            h.ctx,
        )
        .run(),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.task.cancel("client went away");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!phase.is_finished());
    assert_eq!(h.transport.cancel_calls().len(), 1);

    let err = phase.await.expect("join").expect_err("cancelled");
    assert!(matches!(err, SearchError::TaskCancelled(ref r) if r == "client went away"));
    assert_eq!(
        h.transport.cancel_calls(),
        vec![(TaskId(42), "client went away".to_string())]
    );
    assert_eq!(script.calls().len(), 2);
}

#[tokio::test]
async fn breaker_trip_on_a_result_fails_the_phase() {
    let script = Arc::new(Script::default());
    let h = harness_with_breaker(
        &["n1"],
        1,
        options(true),
        CircuitBreaker::new("request", 1),
    );
    let err = run(&script, vec![unit(0, &["n1", "n1"])], h.ctx)
        .await
        .expect_err("breaker trips");
    match err {
        SearchError::SearchPhaseExecution {
            message,
            shard_failures,
            ..
        } => {
            assert!(message.contains("data too large"));
            assert_eq!(failed_indices(&shard_failures), vec![0]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(script.calls().len(), 1);
}

#[tokio::test]
async fn results_with_contexts_are_tracked_in_the_ledger() {
    let script = Arc::new(Script::default().step(1, "n1", Step::Context(9)));
    let h = harness(&["n1"], 2, options(false));
    let ledger = Arc::clone(&h.ctx.ledger);
    run(&script, vec![unit(0, &["n1"]), unit(1, &["n1"])], h.ctx)
        .await
        .expect("all succeed");
    assert!(!ledger.is_open(0));
    assert!(ledger.is_open(1));
    assert_eq!(ledger.release_all("test"), 1);
    assert_eq!(
        h.transport.freed_contexts(),
        vec![(SearchTarget::local("n1"), ContextId::new("n1", 9))]
    );
}

fn batching_script(batched: bool) -> Script {
    let script = Script::default()
        .step(1, "n1", Step::Fail("n1 shard 1 broken"))
        .step(3, "n1", Step::NotAvailable)
        .step(3, "n2", Step::Fail("n2 shard 3 broken"));
    if batched { script.batched() } else { script }
}

async fn run_batching(batched: bool) -> (Arc<Script>, PhaseOutcome<QuerySearchResult>) {
    let script = Arc::new(batching_script(batched));
    let h = harness(
        &["n1", "n2"],
        4,
        PhaseOptions {
            batched,
            ..options(true)
        },
    );
    let units = (0..4).map(|idx| unit(idx, &["n1", "n2"])).collect();
    let outcome = run(&script, units, h.ctx).await.expect("partial allowed");
    (script, outcome)
}

#[tokio::test]
async fn batched_and_unbatched_query_agree() {
    let (plain_script, plain) = run_batching(false).await;
    let (batched_script, batched) = run_batching(true).await;

    assert!(plain_script.batch_calls.lock().expect("batch calls").is_empty());
    assert_eq!(
        *batched_script.batch_calls.lock().expect("batch calls"),
        vec![("n1".to_string(), vec![0, 1, 2, 3])]
    );

    for outcome in [&plain, &batched] {
        assert_eq!(outcome.successful, 3);
        assert_eq!(failed_indices(&outcome.failures), vec![3]);
        assert!(outcome.failures[0].reason().contains("n2 shard 3 broken"));
        assert_eq!(outcome.total_ops, outcome.expected_total_ops);
    }
    let targets = |o: &PhaseOutcome<QuerySearchResult>| -> Vec<(usize, String)> {
        o.results()
            .map(|(idx, r)| (idx, r.target.node.as_str().to_string()))
            .collect()
    };
    assert_eq!(targets(&plain), targets(&batched));
    assert_eq!(
        targets(&batched),
        vec![
            (0, "n1".to_string()),
            (1, "n2".to_string()),
            (2, "n1".to_string())
        ]
    );
}

#[tokio::test]
async fn failed_batch_retries_each_shard_on_its_next_copy() {
    let mut script = Script::default().batched();
    script.batch_timeout = true;
    let script = Arc::new(script);
    let h = harness(
        &["n1", "n2"],
        3,
        PhaseOptions {
            batched: true,
            ..options(false)
        },
    );
    let units = (0..3).map(|idx| unit(idx, &["n1", "n2"])).collect();
    let outcome = run(&script, units, h.ctx).await.expect("replicas answer");
    assert_eq!(outcome.successful, 3);
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.total_ops, 6);
    let mut calls = script.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            (0, "n2".to_string()),
            (1, "n2".to_string()),
            (2, "n2".to_string())
        ]
    );
}

#[tokio::test]
async fn single_shard_groups_skip_the_batch_envelope() {
    let script = Arc::new(Script::default().batched());
    let h = harness(
        &["n1", "n2"],
        2,
        PhaseOptions {
            batched: true,
            ..options(false)
        },
    );
    run(&script, vec![unit(0, &["n1"]), unit(1, &["n2"])], h.ctx)
        .await
        .expect("all succeed");
    assert!(script.batch_calls.lock().expect("batch calls").is_empty());
    assert_eq!(script.calls().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn throttle_bounds_in_flight_attempts_per_node() {
    let mut script = Script::default();
    for idx in 0..12 {
        script = script.delay(idx, "n1", Duration::from_millis(10));
    }
    let script = Arc::new(script);
    let h = harness(
        &["n1"],
        12,
        PhaseOptions {
            max_concurrent_shard_requests: 2,
            ..options(false)
        },
    );
    let units = (0..12).map(|idx| unit(idx, &["n1"])).collect();
    let outcome = run(&script, units, h.ctx).await.expect("all succeed");
    assert_eq!(outcome.successful, 12);
    assert!(script.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(script.calls().len(), 12);
}
