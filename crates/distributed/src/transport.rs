//! Transport contracts between the coordinator and the nodes holding shards,
//! plus the in-process implementation used by embedded deployments and tests.
//!
//! Contract:
//! - `connection` fails synchronously when the node is unreachable
//! - every `execute_*` future resolves exactly once, with a result or an error
//! - `send_free_context` and `cancel_search_task` are fire-and-forget; their
//!   errors are for logging only

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use scatter_common::{ContextId, NodeId, Result, SearchError, SearchTarget, ShardId, TaskId};
use tracing::debug;

use crate::request::{
    NodeQueryRequest, NodeQueryResponse, RankFeatureShardRequest, ShardFetchRequest,
    ShardSearchRequest,
};
use crate::results::{DfsSearchResult, FetchSearchResult, QuerySearchResult, RankFeatureResult};

/// Shard-level remote actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardAction {
    Dfs,
    Query,
    BatchedQuery,
    RankFeature,
    Fetch,
}

impl ShardAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dfs => "dfs",
            Self::Query => "query",
            Self::BatchedQuery => "query[batched]",
            Self::RankFeature => "rank_feature",
            Self::Fetch => "fetch",
        }
    }
}

impl fmt::Display for ShardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved handle to one node, keyed by `(cluster_alias, node)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connection {
    pub target: SearchTarget,
}

impl Connection {
    pub fn node(&self) -> &NodeId {
        &self.target.node
    }
}

#[async_trait]
/// Coordinator-side view of the remote search actions.
pub trait SearchTransport: Send + Sync {
    /// Look up the connection for `target`.
    fn connection(&self, target: &SearchTarget) -> Result<Connection>;
    async fn execute_dfs(
        &self,
        conn: &Connection,
        request: ShardSearchRequest,
        task: TaskId,
    ) -> Result<DfsSearchResult>;
    async fn execute_query(
        &self,
        conn: &Connection,
        request: ShardSearchRequest,
        task: TaskId,
    ) -> Result<QuerySearchResult>;
    /// One envelope for several shards of the same node; the response holds
    /// one outcome per descriptor.
    async fn execute_batched_query(
        &self,
        conn: &Connection,
        request: NodeQueryRequest,
        task: TaskId,
    ) -> Result<NodeQueryResponse>;
    async fn execute_rank_feature(
        &self,
        conn: &Connection,
        request: RankFeatureShardRequest,
        task: TaskId,
    ) -> Result<RankFeatureResult>;
    async fn execute_fetch(
        &self,
        conn: &Connection,
        request: ShardFetchRequest,
        task: TaskId,
    ) -> Result<FetchSearchResult>;
    /// Release server-side state of one context.
    fn send_free_context(&self, conn: &Connection, context_id: &ContextId) -> Result<()>;
    /// Ask every node to cancel work of the given parent task.
    fn cancel_search_task(&self, task: TaskId, reason: &str) -> Result<()>;
}

#[async_trait]
/// Node-side executor of shard actions.
pub trait ShardSearcher: Send + Sync {
    async fn dfs(&self, request: ShardSearchRequest) -> Result<DfsSearchResult>;
    async fn query(&self, request: ShardSearchRequest) -> Result<QuerySearchResult>;
    async fn rank_feature(&self, request: RankFeatureShardRequest) -> Result<RankFeatureResult>;
    async fn fetch(&self, request: ShardFetchRequest) -> Result<FetchSearchResult>;
    /// Returns whether the context existed.
    fn free_context(&self, context_id: &ContextId) -> bool;
}

/// One recorded remote dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub action: ShardAction,
    pub target: SearchTarget,
    pub shards: Vec<ShardId>,
}

#[derive(Debug, Default)]
struct TransportLog {
    dispatches: Vec<Dispatch>,
    cancels: Vec<(TaskId, String)>,
    freed: Vec<(SearchTarget, ContextId)>,
}

/// Transport that calls [`ShardSearcher`]s living in the same process.
///
/// Remote errors are wrapped in [`SearchError::RemoteTransport`], the same
/// shape a network transport produces. Cancelled parent tasks are banned:
/// later dispatches for them fail with a remote task-cancelled error.
pub struct InProcessTransport {
    nodes: HashMap<SearchTarget, Arc<dyn ShardSearcher>>,
    timeout: Option<Duration>,
    disconnected: Mutex<HashSet<SearchTarget>>,
    banned: Mutex<HashSet<TaskId>>,
    log: Mutex<TransportLog>,
}

impl fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            timeout: None,
            disconnected: Mutex::new(HashSet::new()),
            banned: Mutex::new(HashSet::new()),
            log: Mutex::new(TransportLog::default()),
        }
    }

    pub fn with_node(mut self, target: SearchTarget, searcher: Arc<dyn ShardSearcher>) -> Self {
        self.nodes.insert(target, searcher);
        self
    }

    /// Per-request timeout applied to every `execute_*` call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Make connection lookups for `target` fail.
    pub fn disconnect(&self, target: &SearchTarget) {
        self.disconnected
            .lock()
            .expect("transport lock poisoned")
            .insert(target.clone());
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.log
            .lock()
            .expect("transport lock poisoned")
            .dispatches
            .clone()
    }

    pub fn dispatch_count(&self, action: ShardAction) -> usize {
        self.log
            .lock()
            .expect("transport lock poisoned")
            .dispatches
            .iter()
            .filter(|d| d.action == action)
            .count()
    }

    /// Dispatches that carried `shard`, batched envelopes included.
    pub fn dispatches_for(&self, shard: &ShardId) -> usize {
        self.log
            .lock()
            .expect("transport lock poisoned")
            .dispatches
            .iter()
            .filter(|d| d.shards.contains(shard))
            .count()
    }

    pub fn cancel_calls(&self) -> Vec<(TaskId, String)> {
        self.log
            .lock()
            .expect("transport lock poisoned")
            .cancels
            .clone()
    }

    pub fn freed_contexts(&self) -> Vec<(SearchTarget, ContextId)> {
        self.log
            .lock()
            .expect("transport lock poisoned")
            .freed
            .clone()
    }

    fn searcher(&self, conn: &Connection) -> Result<Arc<dyn ShardSearcher>> {
        self.nodes
            .get(&conn.target)
            .cloned()
            .ok_or_else(|| SearchError::NodeNotConnected {
                node: conn.target.node.clone(),
            })
    }

    fn record(&self, action: ShardAction, conn: &Connection, shards: Vec<ShardId>) {
        debug!(
            action = action.as_str(),
            target = %conn.target,
            shards = shards.len(),
            operator = "InProcessTransport",
            "dispatching shard request"
        );
        self.log
            .lock()
            .expect("transport lock poisoned")
            .dispatches
            .push(Dispatch {
                action,
                target: conn.target.clone(),
                shards,
            });
    }

    fn check_banned(&self, conn: &Connection, action: ShardAction, task: TaskId) -> Result<()> {
        if self
            .banned
            .lock()
            .expect("transport lock poisoned")
            .contains(&task)
        {
            return Err(SearchError::remote(
                conn.node().clone(),
                action.as_str(),
                SearchError::TaskCancelled(format!("parent task [{task}] is cancelled")),
            ));
        }
        Ok(())
    }

    async fn call<T, F>(&self, conn: &Connection, action: ShardAction, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send,
    {
        let node = conn.node().clone();
        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(SearchError::Timeout {
                        node,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
            None => fut.await,
        };
        outcome.map_err(|e| SearchError::remote(node, action.as_str(), e))
    }
}

#[async_trait]
impl SearchTransport for InProcessTransport {
    fn connection(&self, target: &SearchTarget) -> Result<Connection> {
        let disconnected = self
            .disconnected
            .lock()
            .expect("transport lock poisoned")
            .contains(target);
        if disconnected || !self.nodes.contains_key(target) {
            return Err(SearchError::NodeNotConnected {
                node: target.node.clone(),
            });
        }
        Ok(Connection {
            target: target.clone(),
        })
    }

    async fn execute_dfs(
        &self,
        conn: &Connection,
        request: ShardSearchRequest,
        task: TaskId,
    ) -> Result<DfsSearchResult> {
        self.record(ShardAction::Dfs, conn, vec![request.shard_id.clone()]);
        self.check_banned(conn, ShardAction::Dfs, task)?;
        let searcher = self.searcher(conn)?;
        self.call(conn, ShardAction::Dfs, searcher.dfs(request)).await
    }

    async fn execute_query(
        &self,
        conn: &Connection,
        request: ShardSearchRequest,
        task: TaskId,
    ) -> Result<QuerySearchResult> {
        self.record(ShardAction::Query, conn, vec![request.shard_id.clone()]);
        self.check_banned(conn, ShardAction::Query, task)?;
        let searcher = self.searcher(conn)?;
        self.call(conn, ShardAction::Query, searcher.query(request))
            .await
    }

    async fn execute_batched_query(
        &self,
        conn: &Connection,
        request: NodeQueryRequest,
        task: TaskId,
    ) -> Result<NodeQueryResponse> {
        let shards = request.shards.iter().map(|s| s.shard_id.clone()).collect();
        self.record(ShardAction::BatchedQuery, conn, shards);
        self.check_banned(conn, ShardAction::BatchedQuery, task)?;
        let searcher = self.searcher(conn)?;
        let node = conn.node().clone();
        let batch = async {
            let outcomes = join_all(
                request
                    .shards
                    .into_iter()
                    .map(|shard| searcher.query(shard)),
            )
            .await;
            let results = outcomes
                .into_iter()
                .map(|r| {
                    r.map_err(|e| {
                        SearchError::remote(node.clone(), ShardAction::Query.as_str(), e)
                    })
                })
                .collect();
            Ok(NodeQueryResponse { results })
        };
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, batch)
                .await
                .unwrap_or_else(|_| {
                    Err(SearchError::Timeout {
                        node: conn.node().clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }),
            None => batch.await,
        }
    }

    async fn execute_rank_feature(
        &self,
        conn: &Connection,
        request: RankFeatureShardRequest,
        task: TaskId,
    ) -> Result<RankFeatureResult> {
        self.record(ShardAction::RankFeature, conn, vec![request.shard_id.clone()]);
        self.check_banned(conn, ShardAction::RankFeature, task)?;
        let searcher = self.searcher(conn)?;
        self.call(conn, ShardAction::RankFeature, searcher.rank_feature(request))
            .await
    }

    async fn execute_fetch(
        &self,
        conn: &Connection,
        request: ShardFetchRequest,
        task: TaskId,
    ) -> Result<FetchSearchResult> {
        self.record(ShardAction::Fetch, conn, vec![request.shard_id.clone()]);
        self.check_banned(conn, ShardAction::Fetch, task)?;
        let searcher = self.searcher(conn)?;
        self.call(conn, ShardAction::Fetch, searcher.fetch(request))
            .await
    }

    fn send_free_context(&self, conn: &Connection, context_id: &ContextId) -> Result<()> {
        self.log
            .lock()
            .expect("transport lock poisoned")
            .freed
            .push((conn.target.clone(), context_id.clone()));
        let searcher = self.searcher(conn)?;
        if !searcher.free_context(context_id) {
            debug!(
                context = %context_id,
                target = %conn.target,
                operator = "InProcessTransport",
                "free context for unknown context"
            );
        }
        Ok(())
    }

    fn cancel_search_task(&self, task: TaskId, reason: &str) -> Result<()> {
        self.banned
            .lock()
            .expect("transport lock poisoned")
            .insert(task);
        self.log
            .lock()
            .expect("transport lock poisoned")
            .cancels
            .push((task, reason.to_string()));
        Ok(())
    }
}
