//! Shard failure records exported with responses and phase failures.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::SearchError;
use crate::ids::{SearchTarget, ShardId};

/// One shard-level failure, keyed by the request's shard index.
#[derive(Debug, Clone)]
pub struct ShardSearchFailure {
    /// Stable shard index within the request.
    pub shard_index: usize,
    /// Shard the failure belongs to, when known.
    pub shard_id: Option<ShardId>,
    /// Copy that produced the failure; `None` when no copy was reachable.
    pub target: Option<SearchTarget>,
    /// Failure cause as reported by the transport.
    pub cause: Arc<SearchError>,
}

impl ShardSearchFailure {
    pub fn new(
        shard_index: usize,
        shard_id: Option<ShardId>,
        target: Option<SearchTarget>,
        cause: impl Into<Arc<SearchError>>,
    ) -> Self {
        Self {
            shard_index,
            shard_id,
            target,
            cause: cause.into(),
        }
    }

    /// Root-cause reason text.
    pub fn reason(&self) -> String {
        self.cause.root_cause().to_string()
    }

    pub fn index(&self) -> Option<&str> {
        self.shard_id.as_ref().map(|s| s.index.as_str())
    }
}

impl fmt::Display for ShardSearchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.shard_id, &self.target) {
            (Some(shard), Some(target)) => write!(f, "{shard} on [{target}]: {}", self.reason()),
            (Some(shard), None) => write!(f, "{shard}: {}", self.reason()),
            _ => write!(f, "shard #{}: {}", self.shard_index, self.reason()),
        }
    }
}

/// Deduplicate failures by (index, root-cause kind, root-cause message).
///
/// The first failure of each group wins; input order is preserved.
pub fn group_by_root_cause(failures: &[ShardSearchFailure]) -> Vec<ShardSearchFailure> {
    let mut seen = HashSet::new();
    failures
        .iter()
        .filter(|f| {
            let key = (
                f.index().map(str::to_string),
                f.cause.kind(),
                f.cause.root_cause().to_string(),
            );
            seen.insert(key)
        })
        .cloned()
        .collect()
}
