//! Per-node admission gate for shard requests.
//!
//! Each node gets a [`PendingExecutions`] with a fixed number of permits.
//! A submitted task runs as soon as a permit is free and receives a
//! [`PermitRelease`] guard; dropping the guard hands the permit to the next
//! queued task (FIFO) or gives it back.
//!
//! Tasks that drop their guard before returning are drained by a loop in the
//! submitting call rather than by recursion, so long chains of synchronously
//! completing tasks run in constant stack depth.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use scatter_common::{NodeId, global_metrics};
use tokio::sync::Semaphore;
use tracing::debug;

/// Unit of work admitted by the throttle.
pub type ThrottledTask = Box<dyn FnOnce(PermitRelease) + Send + 'static>;

const RUNNING: u8 = 0;
const RELEASED_SYNC: u8 = 1;
const DETACHED: u8 = 2;

/// Permit-holding completion guard handed to a running task.
///
/// Releases on drop.
pub struct PermitRelease {
    inner: Option<ReleaseInner>,
}

struct ReleaseInner {
    pending: Arc<PendingExecutions>,
    state: Arc<AtomicU8>,
}

impl PermitRelease {
    /// Guard for work that bypasses throttling.
    pub fn unthrottled() -> Self {
        Self { inner: None }
    }
}

impl std::fmt::Debug for PermitRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitRelease")
            .field("throttled", &self.inner.is_some())
            .finish()
    }
}

impl Drop for PermitRelease {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if inner
            .state
            .compare_exchange(RUNNING, RELEASED_SYNC, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // still inside the submitting drain loop, which picks up the next task
            return;
        }
        if let Some(next) = inner.pending.poll_next_or_release() {
            inner.pending.execute_and_release(next);
        }
    }
}

/// Permit pool and FIFO queue of one node.
pub struct PendingExecutions {
    node: NodeId,
    permits: Semaphore,
    queue: Mutex<VecDeque<ThrottledTask>>,
}

impl std::fmt::Debug for PendingExecutions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingExecutions")
            .field("node", &self.node)
            .field("available_permits", &self.permits.available_permits())
            .field("queued", &self.queued())
            .finish()
    }
}

impl PendingExecutions {
    pub fn new(node: NodeId, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            node,
            permits: Semaphore::new(permits.max(1)),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().expect("throttle queue lock poisoned").len()
    }

    pub fn submit(self: &Arc<Self>, task: ThrottledTask) {
        if self.try_acquire() {
            self.execute_and_release(task);
            return;
        }
        let queued = {
            let mut queue = self.queue.lock().expect("throttle queue lock poisoned");
            queue.push_back(task);
            queue.len()
        };
        global_metrics().set_throttle_queued_tasks(self.node.as_str(), queued as u64);
        debug!(
            node = %self.node,
            queued,
            operator = "PendingExecutions",
            "shard request queued behind node permit"
        );
        // a permit may have been returned between the failed acquire and the enqueue
        if self.try_acquire() {
            if let Some(next) = self.poll_next_or_release() {
                self.execute_and_release(next);
            }
        }
    }

    fn try_acquire(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Run `task` and every task that completes synchronously after it, all
    /// under one permit.
    fn execute_and_release(self: &Arc<Self>, task: ThrottledTask) {
        let mut next = Some(task);
        while let Some(task) = next.take() {
            let state = Arc::new(AtomicU8::new(RUNNING));
            task(PermitRelease {
                inner: Some(ReleaseInner {
                    pending: Arc::clone(self),
                    state: Arc::clone(&state),
                }),
            });
            if state
                .compare_exchange(RUNNING, DETACHED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // guard still held; its drop continues the drain
                return;
            }
            next = self.poll_next_or_release();
        }
    }

    /// Hand the held permit to the next queued task, or give it back.
    fn poll_next_or_release(&self) -> Option<ThrottledTask> {
        if let Some(task) = self.pop() {
            return Some(task);
        }
        self.permits.add_permits(1);
        // re-check: a submitter may have queued after our pop but before the release
        while self.has_queued() && self.try_acquire() {
            match self.pop() {
                Some(task) => return Some(task),
                None => self.permits.add_permits(1),
            }
        }
        None
    }

    fn pop(&self) -> Option<ThrottledTask> {
        let mut queue = self.queue.lock().expect("throttle queue lock poisoned");
        let task = queue.pop_front();
        if task.is_some() {
            global_metrics().set_throttle_queued_tasks(self.node.as_str(), queue.len() as u64);
        }
        task
    }

    fn has_queued(&self) -> bool {
        !self.queue.lock().expect("throttle queue lock poisoned").is_empty()
    }
}

/// Per-phase map of node throttles.
///
/// Throttling only applies when the phase has more participating shards than
/// the per-node permit count; otherwise every task runs immediately.
#[derive(Debug)]
pub struct PendingExecutionThrottle {
    max_concurrent_per_node: usize,
    enabled: bool,
    nodes: Mutex<HashMap<NodeId, Arc<PendingExecutions>>>,
}

impl PendingExecutionThrottle {
    pub fn new(max_concurrent_per_node: usize, num_shards: usize) -> Self {
        let max_concurrent_per_node = max_concurrent_per_node.max(1);
        Self {
            max_concurrent_per_node,
            enabled: num_shards > max_concurrent_per_node,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_concurrent_per_node(&self) -> usize {
        self.max_concurrent_per_node
    }

    pub fn submit(&self, node: &NodeId, task: ThrottledTask) {
        if !self.enabled {
            task(PermitRelease::unthrottled());
            return;
        }
        let pending = {
            let mut nodes = self.nodes.lock().expect("throttle map lock poisoned");
            Arc::clone(nodes.entry(node.clone()).or_insert_with(|| {
                PendingExecutions::new(node.clone(), self.max_concurrent_per_node)
            }))
        };
        pending.submit(task);
    }

    /// Throttle of `node`, once a task was submitted for it.
    pub fn node(&self, node: &NodeId) -> Option<Arc<PendingExecutions>> {
        self.nodes
            .lock()
            .expect("throttle map lock poisoned")
            .get(node)
            .cloned()
    }
}
