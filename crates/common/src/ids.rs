//! Typed identifiers shared across coordinator/transport components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one shard of one index.
///
/// Ordering is by index name, then shard number; shard-index assignment for a
/// request relies on this order being total and stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name.
    pub index: String,
    /// Shard number within the index.
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

/// Stable cluster node identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(
    /// Raw node id value.
    pub String,
);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of server-side per-shard search state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId {
    /// Session that allocated the context (one per node process).
    pub session: String,
    /// Context number within the session.
    pub id: u64,
}

impl ContextId {
    pub fn new(session: impl Into<String>, id: u64) -> Self {
        Self {
            session: session.into(),
            id,
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.id)
    }
}

/// Identifier of the coordinating search task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One copy of a shard that a request can be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchTarget {
    /// Node hosting the copy.
    pub node: NodeId,
    /// Remote cluster alias, `None` for the local cluster.
    pub cluster_alias: Option<String>,
}

impl SearchTarget {
    pub fn local(node: impl Into<String>) -> Self {
        Self {
            node: NodeId::new(node),
            cluster_alias: None,
        }
    }

    pub fn remote(cluster_alias: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            node: NodeId::new(node),
            cluster_alias: Some(cluster_alias.into()),
        }
    }
}

impl fmt::Display for SearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cluster_alias {
            Some(alias) => write!(f, "{alias}:{}", self.node),
            None => write!(f, "{}", self.node),
        }
    }
}
