//! Explicit free lists for per-request objects
//!
//! Every pooled object follows `acquire -> use once -> release`. Objects are
//! reset when they are acquired, so nothing written during a previous request
//! can leak into the next one, whichever path released it.

use crate::limits::RespLimits;
use crossbeam::queue::ArrayQueue;
use std::fmt;

/// An object that can live in a [`Pool`].
pub trait Reusable: Send + Sized {
    /// Builds a fresh object when the pool is empty.
    fn create(limits: &RespLimits) -> Self;

    /// Returns the object to its freshly created state, keeping allocations.
    fn reset(&mut self);

    /// Heap bytes retained by the object, compared against
    /// [`RespLimits::max_capacity`] on release.
    fn capacity(&self) -> usize;
}

/// Bounded, lock-free pool shared by all event loops.
pub struct Pool<T: Reusable> {
    queue: ArrayQueue<T>,
    limits: RespLimits,
}

impl<T: Reusable> Pool<T> {
    /// Creates an empty pool holding at most `limits.pool_size` idle objects.
    pub fn new(limits: &RespLimits) -> Self {
        Pool {
            queue: ArrayQueue::new(limits.pool_size.max(1)),
            limits: limits.clone(),
        }
    }

    /// Takes an idle object (or creates one) and resets it.
    #[inline]
    pub fn acquire(&self) -> T {
        let mut value = self
            .queue
            .pop()
            .unwrap_or_else(|| T::create(&self.limits));
        value.reset();
        value
    }

    /// Returns an object to the pool.
    ///
    /// Objects that grew past `max_capacity`, or that do not fit because the
    /// pool is full, are dropped.
    #[inline]
    pub fn release(&self, value: T) {
        if value.capacity() > self.limits.max_capacity {
            return;
        }
        let _ = self.queue.push(value);
    }

    /// Number of idle objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Reusable> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

impl Reusable for Vec<u8> {
    #[inline]
    fn create(limits: &RespLimits) -> Self {
        Vec::with_capacity(limits.default_capacity)
    }

    #[inline]
    fn reset(&mut self) {
        self.clear();
    }

    #[inline]
    fn capacity(&self) -> usize {
        Vec::capacity(self)
    }
}
