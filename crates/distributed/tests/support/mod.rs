#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use scatter_common::{CoordinatorConfig, SearchTarget, ShardId, TaskId};
use scatter_distributed::{
    InMemoryShardSearcher, InProcessTransport, IndexedDoc, SearchAction, SearchTask,
    StaticTopology,
};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub const NODES: [&str; 2] = ["n1", "n2"];

/// Documents of `books` shards 0..3; every shard has a copy on n1 then n2.
pub fn books() -> Vec<(ShardId, Vec<IndexedDoc>)> {
    vec![
        (
            ShardId::new("books", 0),
            vec![
                IndexedDoc::new("a0", "rust async runtime").with_rank_feature(0.1),
                IndexedDoc::new("a1", "garbage collector").with_rank_feature(0.8),
                IndexedDoc::new("a2", "rust ownership").with_rank_feature(0.9),
            ],
        ),
        (
            ShardId::new("books", 1),
            vec![
                IndexedDoc::new("b0", "rust rust borrow").with_rank_feature(0.5),
                IndexedDoc::new("b1", "python").with_rank_feature(0.3),
            ],
        ),
        (
            ShardId::new("books", 2),
            vec![
                IndexedDoc::new("c0", "go channels").with_rank_feature(0.2),
                IndexedDoc::new("c1", "async rust").with_rank_feature(0.7),
            ],
        ),
    ]
}

pub struct Cluster {
    pub searchers: Vec<Arc<InMemoryShardSearcher>>,
    pub transport: Arc<InProcessTransport>,
    pub topology: StaticTopology,
}

impl Cluster {
    pub fn new(shards: Vec<(ShardId, Vec<IndexedDoc>)>) -> Self {
        Self::build(shards, |_| None, None)
    }

    /// Cluster whose first node answers every action after `delay` and whose
    /// transport gives up after `timeout`.
    pub fn with_slow_first_node(
        shards: Vec<(ShardId, Vec<IndexedDoc>)>,
        delay: Duration,
        timeout: Duration,
    ) -> Self {
        Self::build(
            shards,
            |node| (node == "n1").then_some(delay),
            Some(timeout),
        )
    }

    fn build<F>(
        shards: Vec<(ShardId, Vec<IndexedDoc>)>,
        delay_for: F,
        timeout: Option<Duration>,
    ) -> Self
    where
        F: Fn(&str) -> Option<Duration>,
    {
        init_tracing();
        let mut searchers = Vec::new();
        let mut transport = InProcessTransport::new();
        if let Some(timeout) = timeout {
            transport = transport.with_timeout(timeout);
        }
        for node in NODES {
            let mut searcher = InMemoryShardSearcher::new(node);
            for (shard_id, docs) in &shards {
                searcher = searcher.with_shard(shard_id.clone(), docs.clone());
            }
            if let Some(delay) = delay_for(node) {
                searcher = searcher.with_delay(delay);
            }
            let searcher = Arc::new(searcher);
            transport = transport.with_node(SearchTarget::local(node), searcher.clone());
            searchers.push(searcher);
        }
        let topology = shards.iter().fold(StaticTopology::new(), |t, (shard_id, _)| {
            t.with_shard(
                shard_id.clone(),
                NODES.iter().map(|n| SearchTarget::local(*n)).collect(),
            )
        });
        Self {
            searchers,
            transport: Arc::new(transport),
            topology,
        }
    }

    pub fn searcher(&self, node: &str) -> &InMemoryShardSearcher {
        let idx = NODES.iter().position(|n| *n == node).unwrap_or(0);
        &self.searchers[idx]
    }

    pub fn open_contexts(&self) -> usize {
        self.searchers.iter().map(|s| s.open_contexts()).sum()
    }

    pub fn action(&self, config: CoordinatorConfig) -> SearchAction {
        SearchAction::new(
            self.transport.clone(),
            Arc::new(self.topology.clone()),
            config,
        )
    }
}

pub fn task(id: u64) -> Arc<SearchTask> {
    SearchTask::new(TaskId(id))
}

pub fn hit_ids(response: &scatter_distributed::SearchResponse) -> Vec<String> {
    response.hits.iter().map(|h| h.id.clone()).collect()
}

pub fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}
