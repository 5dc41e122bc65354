//! Lazily allocated per-shard failure slots.

use std::sync::{Mutex, OnceLock};

use scatter_common::ShardSearchFailure;

/// At most one current failure per shard index.
///
/// Storage is allocated on the first recorded failure; a phase without
/// failures never allocates. Slot writes are partitioned by shard index, so
/// each slot carries its own lock.
#[derive(Debug)]
pub struct FailureTracker {
    num_shards: usize,
    slots: OnceLock<Vec<Mutex<Option<ShardSearchFailure>>>>,
}

impl FailureTracker {
    pub fn new(num_shards: usize) -> Self {
        Self {
            num_shards,
            slots: OnceLock::new(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Whether any slot storage exists yet.
    pub fn is_allocated(&self) -> bool {
        self.slots.get().is_some()
    }

    /// Record `failure` for its shard index.
    ///
    /// A shard-not-available failure never replaces an existing one and is
    /// always replaced by any other kind; otherwise the first failure stays.
    /// Returns whether the failure was stored.
    pub fn record(&self, failure: ShardSearchFailure) -> bool {
        let idx = failure.shard_index;
        if idx >= self.num_shards {
            return false;
        }
        let slots = self.slots.get_or_init(|| {
            (0..self.num_shards).map(|_| Mutex::new(None)).collect()
        });
        let mut slot = slots[idx].lock().expect("failure slot lock poisoned");
        let replace = match slot.as_ref() {
            None => true,
            Some(existing) => {
                existing.cause.is_shard_not_available() && !failure.cause.is_shard_not_available()
            }
        };
        if replace {
            *slot = Some(failure);
        }
        replace
    }

    /// Drop the failure of a shard that later succeeded.
    pub fn clear(&self, shard_index: usize) -> Option<ShardSearchFailure> {
        let slots = self.slots.get()?;
        slots
            .get(shard_index)?
            .lock()
            .expect("failure slot lock poisoned")
            .take()
    }

    pub fn get(&self, shard_index: usize) -> Option<ShardSearchFailure> {
        let slots = self.slots.get()?;
        slots
            .get(shard_index)?
            .lock()
            .expect("failure slot lock poisoned")
            .clone()
    }

    pub fn failed_count(&self) -> usize {
        self.slots.get().map_or(0, |slots| {
            slots
                .iter()
                .filter(|s| s.lock().expect("failure slot lock poisoned").is_some())
                .count()
        })
    }

    /// Exported failure list in shard order, unset slots omitted.
    pub fn build_failures(&self) -> Vec<ShardSearchFailure> {
        let Some(slots) = self.slots.get() else {
            return Vec::new();
        };
        slots
            .iter()
            .filter_map(|s| s.lock().expect("failure slot lock poisoned").clone())
            .collect()
    }
}
