//! Global accounting of resident buffer memory.
//!
//! Every stage of the build pipeline allocates its in-memory buffers through a
//! [BufferManager]. The manager only hands out a [BufferReservation] if the total number of
//! reserved bytes stays below the limit (memory budget minus a reserved margin). If the
//! budget is exhausted, [BufferManager::reserve] blocks until another reservation is dropped.
//! This is the back pressure mechanism that bounds the memory footprint of a build,
//! regardless of the size of the data set.

use crate::span;
use log::trace;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;

pub struct BufferManager {
    inner: Mutex<BudgetInner>,
    wakeup: Condvar,
}

struct BudgetInner {
    /// Bytes currently reserved by live reservations.
    resident: usize,

    /// Upper bound for `resident`.
    limit: usize,

    /// Highest value `resident` ever reached.
    peak: usize,
}

/// A number of bytes reserved from a [BufferManager].
/// The bytes are given back when the reservation is dropped.
#[must_use]
pub struct BufferReservation {
    manager: Arc<BufferManager>,
    bytes: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BudgetError {
    /// The reservation could never be satisfied, even with all other buffers released.
    #[error("Cannot reserve {requested} bytes: exceeds the buffer limit of {limit} bytes")]
    ExceedsBudget { requested: usize, limit: usize },
}

impl BufferManager {
    /// Creates a new manager.
    /// At most `memory_budget - reserved_margin` bytes can be reserved at the same time.
    pub fn new(memory_budget: usize, reserved_margin: usize) -> Arc<Self> {
        Arc::new(BufferManager {
            inner: Mutex::new(BudgetInner {
                resident: 0,
                limit: memory_budget.saturating_sub(reserved_margin),
                peak: 0,
            }),
            wakeup: Condvar::new(),
        })
    }

    /// Maximum number of bytes that can be reserved at the same time.
    pub fn limit(&self) -> usize {
        self.inner.lock().unwrap().limit
    }

    /// Number of bytes currently reserved.
    pub fn resident(&self) -> usize {
        self.inner.lock().unwrap().resident
    }

    /// Highest number of bytes that were reserved at the same time so far.
    pub fn peak(&self) -> usize {
        self.inner.lock().unwrap().peak
    }

    /// Reserves the given number of bytes, if that is possible without blocking.
    pub fn try_reserve(self: &Arc<Self>, bytes: usize) -> Option<BufferReservation> {
        let mut lock = self.inner.lock().unwrap();
        if lock.resident + bytes > lock.limit {
            return None;
        }
        lock.add(bytes);
        Some(BufferReservation {
            manager: Arc::clone(self),
            bytes,
        })
    }

    /// Reserves the given number of bytes.
    /// Blocks until enough bytes have been released by other reservations.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Result<BufferReservation, BudgetError> {
        let _span = span!("BufferManager::reserve");
        let mut lock = self.inner.lock().unwrap();
        if bytes > lock.limit {
            return Err(BudgetError::ExceedsBudget {
                requested: bytes,
                limit: lock.limit,
            });
        }
        while lock.resident + bytes > lock.limit {
            trace!(
                "Waiting for {bytes} bytes of buffer memory ({} of {} in use)",
                lock.resident,
                lock.limit
            );
            lock = self.wakeup.wait(lock).unwrap();
        }
        lock.add(bytes);
        Ok(BufferReservation {
            manager: Arc::clone(self),
            bytes,
        })
    }

    fn release(&self, bytes: usize) {
        let mut lock = self.inner.lock().unwrap();
        debug_assert!(lock.resident >= bytes);
        lock.resident -= bytes;
        drop(lock);
        self.wakeup.notify_all();
    }
}

impl BudgetInner {
    fn add(&mut self, bytes: usize) {
        self.resident += bytes;
        if self.resident > self.peak {
            self.peak = self.resident;
        }
    }
}

impl Debug for BufferManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let lock = self.inner.lock().unwrap();
        f.debug_struct("BufferManager")
            .field("resident", &lock.resident)
            .field("limit", &lock.limit)
            .field("peak", &lock.peak)
            .finish()
    }
}

impl BufferReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for BufferReservation {
    fn drop(&mut self) {
        self.manager.release(self.bytes);
    }
}
