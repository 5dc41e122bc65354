//! Indexed per-phase result buffer.

use std::sync::{Arc, Mutex, OnceLock};

use scatter_common::{BreakerReservation, CircuitBreaker, Result, SearchError};
use tracing::warn;

use crate::results::PhaseResult;

/// At most one successful result per shard index.
///
/// Every consumed result is charged against the request circuit breaker. The
/// charges are given back exactly once, by [`ResultSink::release`] or on drop,
/// whichever comes first.
#[derive(Debug)]
pub struct ResultSink<R> {
    slots: Vec<OnceLock<R>>,
    breaker: Arc<CircuitBreaker>,
    reservations: Mutex<Option<Vec<BreakerReservation>>>,
}

impl<R: PhaseResult> ResultSink<R> {
    pub fn new(num_shards: usize, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            slots: (0..num_shards).map(|_| OnceLock::new()).collect(),
            breaker,
            reservations: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.slots.len()
    }

    pub fn has_result(&self, shard_index: usize) -> bool {
        self.slots
            .get(shard_index)
            .is_some_and(|slot| slot.get().is_some())
    }

    pub fn get(&self, shard_index: usize) -> Option<&R> {
        self.slots.get(shard_index).and_then(OnceLock::get)
    }

    /// Populated slots in shard-index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &R)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.get().map(|r| (idx, r)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `result` at `shard_index`, then run `on_terminal` with the
    /// stored result.
    ///
    /// A slot that already holds a result is left untouched and the call
    /// fails; so does a breaker trip, in which case the result is dropped.
    pub fn consume_result<F>(&self, shard_index: usize, result: R, on_terminal: F) -> Result<()>
    where
        F: FnOnce(&R),
    {
        let slot = self.slots.get(shard_index).ok_or_else(|| {
            SearchError::Execution(format!(
                "shard index {shard_index} out of range for {} shards",
                self.slots.len()
            ))
        })?;
        if slot.get().is_some() {
            return Err(SearchError::Execution(format!(
                "shard index {shard_index} already holds a result"
            )));
        }
        let reservation = self.breaker.reserve(result.estimated_size_bytes())?;
        if slot.set(result).is_err() {
            return Err(SearchError::Execution(format!(
                "shard index {shard_index} already holds a result"
            )));
        }
        {
            let mut guard = self.reservations.lock().expect("sink reservations lock poisoned");
            match guard.as_mut() {
                Some(held) => held.push(reservation),
                None => warn!(
                    shard_index,
                    operator = "ResultSink",
                    "result consumed after release; charge returned immediately"
                ),
            }
        }
        if let Some(stored) = slot.get() {
            on_terminal(stored);
        }
        Ok(())
    }

    /// Give back every breaker charge. Returns `false` if already released.
    pub fn release(&self) -> bool {
        let taken = self
            .reservations
            .lock()
            .expect("sink reservations lock poisoned")
            .take();
        taken.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.reservations
            .lock()
            .expect("sink reservations lock poisoned")
            .is_none()
    }
}
