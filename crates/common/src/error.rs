use thiserror::Error;

use crate::failure::ShardSearchFailure;
use crate::ids::{ContextId, NodeId, ShardId};

/// Canonical error taxonomy used across the coordinator crates.
///
/// Classification guidance:
/// - shard-copy-unavailable ([`SearchError::NoShardAvailable`],
///   [`SearchError::ShardNotFound`]): no queryable copy at the chosen target;
///   least specific, always superseded by any other failure for the same shard
/// - remote-execution ([`SearchError::RemoteTransport`] wrapping the cause the
///   remote node raised, [`SearchError::Timeout`], [`SearchError::NodeNotConnected`])
/// - [`SearchError::TaskCancelled`]: the search task was cancelled
/// - [`SearchError::SearchPhaseExecution`]: request-fatal phase failure
#[derive(Debug, Error)]
pub enum SearchError {
    /// Invalid or inconsistent configuration / request parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No copy of the shard is currently assigned to any node.
    #[error("no shard available for {shard}: {reason}")]
    NoShardAvailable { shard: ShardId, reason: String },

    /// The target node does not (or no longer) hold the shard.
    #[error("shard {shard} not found on the target node")]
    ShardNotFound { shard: ShardId },

    /// Connection lookup failed for the node.
    #[error("node [{node}] not connected")]
    NodeNotConnected { node: NodeId },

    /// Error raised on a remote node, wrapped by the transport.
    #[error("[{node}][{action}] {cause}")]
    RemoteTransport {
        node: NodeId,
        action: String,
        #[source]
        cause: Box<SearchError>,
    },

    /// Shard-level execution failed on the node that ran it.
    #[error("shard execution failed: {0}")]
    ShardExecution(String),

    /// The transport gave up waiting for a response.
    #[error("[{node}] request timed out after {timeout_ms}ms")]
    Timeout { node: NodeId, timeout_ms: u64 },

    /// A later phase referenced a search context that no longer exists.
    #[error("no search context found for id [{0}]")]
    ContextMissing(ContextId),

    /// The search task was cancelled.
    #[error("task cancelled [{0}]")]
    TaskCancelled(String),

    /// Request circuit breaker refused a reservation.
    #[error(
        "[{breaker}] data too large: would use {would_use_bytes} bytes, limit {limit_bytes} bytes"
    )]
    CircuitBreaking {
        breaker: String,
        would_use_bytes: usize,
        limit_bytes: usize,
    },

    /// Request-fatal failure of one search phase.
    #[error("{phase} phase failed: {message}")]
    SearchPhaseExecution {
        phase: String,
        message: String,
        shard_failures: Vec<ShardSearchFailure>,
    },

    /// Coordinator-side invariant or runtime failure.
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, SearchError>;

impl SearchError {
    /// Wrap an error raised by a remote node.
    pub fn remote(node: NodeId, action: impl Into<String>, cause: SearchError) -> Self {
        Self::RemoteTransport {
            node,
            action: action.into(),
            cause: Box::new(cause),
        }
    }

    /// Build a request-fatal phase failure.
    pub fn phase_failure(
        phase: impl Into<String>,
        message: impl Into<String>,
        shard_failures: Vec<ShardSearchFailure>,
    ) -> Self {
        Self::SearchPhaseExecution {
            phase: phase.into(),
            message: message.into(),
            shard_failures,
        }
    }

    /// The innermost error, unwrapping remote transport layers.
    pub fn root_cause(&self) -> &SearchError {
        let mut current = self;
        while let Self::RemoteTransport { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// Whether this failure only says "no copy available here".
    pub fn is_shard_not_available(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::NoShardAvailable { .. } | Self::ShardNotFound { .. }
        )
    }

    pub fn is_task_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::TaskCancelled(_))
    }

    /// Short stable name of the root cause kind, used for failure grouping.
    pub fn kind(&self) -> &'static str {
        match self.root_cause() {
            Self::InvalidConfig(_) => "invalid_config",
            Self::NoShardAvailable { .. } => "no_shard_available",
            Self::ShardNotFound { .. } => "shard_not_found",
            Self::NodeNotConnected { .. } => "node_not_connected",
            Self::RemoteTransport { .. } => "remote_transport",
            Self::ShardExecution(_) => "shard_execution",
            Self::Timeout { .. } => "timeout",
            Self::ContextMissing(_) => "context_missing",
            Self::TaskCancelled(_) => "task_cancelled",
            Self::CircuitBreaking { .. } => "circuit_breaking",
            Self::SearchPhaseExecution { .. } => "search_phase_execution",
            Self::Execution(_) => "execution",
            Self::Io(_) => "io",
        }
    }

    /// HTTP-like status code used when surfacing the error.
    pub fn status(&self) -> u16 {
        match self.root_cause() {
            Self::InvalidConfig(_) | Self::TaskCancelled(_) => 400,
            Self::ContextMissing(_) => 404,
            Self::CircuitBreaking { .. } => 429,
            Self::NoShardAvailable { .. } | Self::ShardNotFound { .. } => 503,
            Self::NodeNotConnected { .. } => 503,
            Self::Timeout { .. } => 504,
            Self::SearchPhaseExecution { shard_failures, .. } => shard_failures
                .iter()
                .map(|f| f.cause.status())
                .max()
                .unwrap_or(503),
            _ => 500,
        }
    }

    /// Shard failures attached to a phase failure, empty otherwise.
    pub fn shard_failures(&self) -> &[ShardSearchFailure] {
        match self {
            Self::SearchPhaseExecution { shard_failures, .. } => shard_failures,
            _ => &[],
        }
    }
}
