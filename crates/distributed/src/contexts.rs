//! Bookkeeping of server-side search contexts opened on behalf of a request.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use scatter_common::{ContextId, SearchTarget, global_metrics};
use tracing::{debug, warn};

use crate::transport::SearchTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenContext {
    context_id: ContextId,
    target: SearchTarget,
}

/// Open contexts keyed by shard index.
///
/// Every tracked context leaves the ledger exactly once: either consumed by a
/// fetch (the remote frees it itself) or released through
/// [`SearchTransport::send_free_context`]. Point-in-time ledgers track nothing.
pub struct ContextLedger {
    transport: Arc<dyn SearchTransport>,
    point_in_time: bool,
    open: Mutex<BTreeMap<usize, OpenContext>>,
}

impl std::fmt::Debug for ContextLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLedger")
            .field("point_in_time", &self.point_in_time)
            .field("open", &self.open_count())
            .finish()
    }
}

impl ContextLedger {
    pub fn new(transport: Arc<dyn SearchTransport>, point_in_time: bool) -> Self {
        Self {
            transport,
            point_in_time,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn track(&self, shard_index: usize, context_id: &ContextId, target: &SearchTarget) {
        if self.point_in_time {
            return;
        }
        let replaced = {
            let mut open = self.open.lock().expect("context ledger lock poisoned");
            // later phases report the context they were handed back
            if open
                .get(&shard_index)
                .is_some_and(|old| old.context_id == *context_id)
            {
                return;
            }
            open.insert(
                shard_index,
                OpenContext {
                    context_id: context_id.clone(),
                    target: target.clone(),
                },
            )
        };
        if let Some(old) = replaced {
            self.free(shard_index, old, "superseded");
        }
    }

    /// The context was freed remotely as part of the shard's last phase.
    pub fn consume(&self, shard_index: usize) -> bool {
        self.open
            .lock()
            .expect("context ledger lock poisoned")
            .remove(&shard_index)
            .is_some()
    }

    /// Release every context except those of `keep`.
    pub fn release_except(&self, keep: &BTreeSet<usize>, phase: &str) -> usize {
        let released: Vec<(usize, OpenContext)> = {
            let mut open = self.open.lock().expect("context ledger lock poisoned");
            let drop_keys: Vec<usize> = open
                .keys()
                .filter(|idx| !keep.contains(idx))
                .copied()
                .collect();
            drop_keys
                .into_iter()
                .filter_map(|idx| open.remove(&idx).map(|ctx| (idx, ctx)))
                .collect()
        };
        let count = released.len();
        for (idx, ctx) in released {
            self.free(idx, ctx, phase);
        }
        count
    }

    pub fn release_all(&self, phase: &str) -> usize {
        self.release_except(&BTreeSet::new(), phase)
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().expect("context ledger lock poisoned").len()
    }

    pub fn is_open(&self, shard_index: usize) -> bool {
        self.open
            .lock()
            .expect("context ledger lock poisoned")
            .contains_key(&shard_index)
    }

    fn free(&self, shard_index: usize, ctx: OpenContext, phase: &str) {
        global_metrics().inc_freed_contexts(phase);
        debug!(
            shard_index,
            context = %ctx.context_id,
            target = %ctx.target,
            phase,
            operator = "ContextLedger",
            "releasing search context"
        );
        let sent = self
            .transport
            .connection(&ctx.target)
            .and_then(|conn| self.transport.send_free_context(&conn, &ctx.context_id));
        if let Err(e) = sent {
            warn!(
                shard_index,
                context = %ctx.context_id,
                target = %ctx.target,
                error = %e,
                operator = "ContextLedger",
                "failed to release search context"
            );
        }
    }
}
