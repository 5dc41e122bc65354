//! Request circuit breaker for buffered shard results.
//!
//! The coordinator holds every shard result of a phase in memory until the
//! phase is reduced. Each buffered result is charged against a shared byte
//! budget; a reservation that would exceed the budget trips the breaker
//! instead of degrading. Reservations are RAII guards and give their bytes
//! back when dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, SearchError};

/// Shared byte budget.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    limit_bytes: usize,
    used_bytes: AtomicUsize,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limit_bytes,
            used_bytes: AtomicUsize::new(0),
        })
    }

    /// Breaker that never trips.
    #[must_use]
    pub fn unlimited(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, usize::MAX)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Reserve `bytes` or trip with [`SearchError::CircuitBreaking`].
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Result<BreakerReservation> {
        if bytes == 0 {
            return Ok(BreakerReservation {
                breaker: Arc::clone(self),
                bytes: 0,
            });
        }
        loop {
            let current = self.used_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if next > self.limit_bytes {
                return Err(SearchError::CircuitBreaking {
                    breaker: self.name.clone(),
                    would_use_bytes: next,
                    limit_bytes: self.limit_bytes,
                });
            }
            if self
                .used_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(BreakerReservation {
                    breaker: Arc::clone(self),
                    bytes,
                });
            }
        }
    }
}

/// RAII reservation that releases breaker budget on drop.
#[derive(Debug)]
pub struct BreakerReservation {
    breaker: Arc<CircuitBreaker>,
    bytes: usize,
}

impl BreakerReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for BreakerReservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.breaker
                .used_bytes
                .fetch_sub(self.bytes, Ordering::AcqRel);
        }
    }
}
