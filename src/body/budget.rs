//! Weighted, non-blocking budget for in-flight buffered body bytes.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::error::{OpaError, OpaResult};

/// Process-wide counter bounding the total number of body bytes buffered
/// for policy input at any moment. Acquisition never blocks: when the
/// budget is exhausted the caller is told immediately.
#[derive(Debug)]
pub struct BodyBudget {
    capacity: u64,
    used: AtomicU64,
}

impl BodyBudget {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicU64::new(0),
        })
    }

    /// Reserve `bytes` units. The reservation is released when the returned
    /// guard drops, so partial failures cannot leak budget.
    pub fn try_acquire(self: &Arc<Self>, bytes: u64) -> OpaResult<Reservation> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used + bytes > self.capacity {
                return Err(OpaError::BodyBudgetExceeded);
            }
            match self.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(Reservation {
                        budget: Arc::clone(self),
                        bytes,
                    })
                }
                Err(current) => used = current,
            }
        }
    }

    /// Bytes currently reserved.
    pub fn in_use(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Scope guard for one reservation.
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<BodyBudget>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}
