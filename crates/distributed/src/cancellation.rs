//! Client task handle and the bridge that forwards cancellation to the
//! remote nodes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use scatter_common::{TaskId, global_metrics};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::transport::SearchTransport;

/// Coordinating task of one search request.
#[derive(Debug)]
pub struct SearchTask {
    id: TaskId,
    cancelled: AtomicBool,
    reason: OnceLock<String>,
    /// Flips to `true` once, after `reason` is set.
    signal: watch::Sender<bool>,
}

impl SearchTask {
    pub fn new(id: TaskId) -> Arc<Self> {
        let (signal, _) = watch::channel(false);
        Arc::new(Self {
            id,
            cancelled: AtomicBool::new(false),
            reason: OnceLock::new(),
            signal,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancel the task. The first caller wins; returns whether this call did it.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.reason.set(reason.into());
        self.signal.send_replace(true);
        true
    }

    /// Resolves once the task is cancelled, immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // the sender lives as long as the task, so this only ends on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }
}

/// Where a cancellation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// Partial results are disallowed and a shard exhausted its copies.
    PartialFailure,
    /// The client cancelled the task.
    Client,
}

impl CancelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PartialFailure => "partial_failure",
            Self::Client => "client",
        }
    }
}

/// Sends at most one remote cancel per request, whichever source fires first.
pub struct CancellationBridge {
    task: Arc<SearchTask>,
    transport: Arc<dyn SearchTransport>,
    sent: AtomicBool,
    self_initiated: AtomicBool,
}

impl std::fmt::Debug for CancellationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationBridge")
            .field("task", &self.task.id())
            .field("sent", &self.sent.load(Ordering::Acquire))
            .field("self_initiated", &self.self_initiated.load(Ordering::Acquire))
            .finish()
    }
}

impl CancellationBridge {
    pub fn new(task: Arc<SearchTask>, transport: Arc<dyn SearchTransport>) -> Self {
        Self {
            task,
            transport,
            sent: AtomicBool::new(false),
            self_initiated: AtomicBool::new(false),
        }
    }

    pub fn task(&self) -> &Arc<SearchTask> {
        &self.task
    }

    /// Whether the coordinator cancelled the remote work itself.
    pub fn is_self_initiated(&self) -> bool {
        self.self_initiated.load(Ordering::Acquire)
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// Further shard attempts should not be dispatched.
    pub fn should_short_circuit(&self) -> bool {
        self.is_self_initiated() || self.task.is_cancelled()
    }

    /// Cancel remote work because partial results are disallowed and a shard
    /// failed for good. Returns whether this call sent the cancel.
    pub fn cancel_on_partial_failure(&self) -> bool {
        self.send(
            CancelSource::PartialFailure,
            "partial results are not allowed and at least one shard has failed",
        )
    }

    /// Forward an observed client cancellation. No-op unless the task is
    /// cancelled.
    pub fn propagate_client_cancellation(&self) -> bool {
        if !self.task.is_cancelled() {
            return false;
        }
        let reason = self.task.reason().unwrap_or("cancelled by client").to_string();
        self.send(CancelSource::Client, &reason)
    }

    fn send(&self, source: CancelSource, reason: &str) -> bool {
        if self
            .sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if source == CancelSource::PartialFailure {
            self.self_initiated.store(true, Ordering::Release);
        }
        global_metrics().inc_search_cancellations(source.as_str());
        info!(
            task_id = %self.task.id(),
            source = source.as_str(),
            reason,
            operator = "CancellationBridge",
            "cancelling remote search work"
        );
        if let Err(e) = self.transport.cancel_search_task(self.task.id(), reason) {
            warn!(
                task_id = %self.task.id(),
                error = %e,
                operator = "CancellationBridge",
                "remote cancel delivery failed"
            );
        }
        true
    }
}
