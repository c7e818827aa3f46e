//! Bounded pool of build workers.
//!
//! The pool is a semaphore with one permit per worker slot. Submitting a
//! build acquires a permit, suspending the submitter cooperatively while the
//! pool is saturated; that suspension is the backpressure the dispatcher
//! applies upstream. The waiting count doubles as the queue-depth signal the
//! dispatcher consults when deciding between local and remote builds.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

/// Error returned once the pool has been shut down.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

struct PoolInner {
    semaphore: Semaphore,
    capacity: usize,
    waiting: AtomicUsize,
    running: AtomicUsize,
}

/// Bounded build-worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool with `capacity` concurrent slots (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Semaphore::new(capacity),
                capacity,
                waiting: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Submissions currently suspended waiting for a free slot.
    pub fn queue_depth(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Builds currently occupying a slot.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Runs `work` on a pool slot, suspending until one frees up.
    ///
    /// The permit is held for the whole build. Dropping the returned future
    /// while suspended or mid-build releases the slot and the counters.
    pub async fn run<F>(&self, work: F) -> Result<F::Output, PoolClosed>
    where
        F: Future,
    {
        let _waiting = CounterGuard::increment(&self.inner.waiting);
        let permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| PoolClosed)?;
        drop(_waiting);

        let _running = CounterGuard::increment(&self.inner.running);
        let output = work.await;
        drop(permit);
        Ok(output)
    }

    /// Shuts the pool down: running builds finish, new submissions fail.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

/// Decrements its counter on drop, so cancelled submissions cannot leak
/// queue depth.
struct CounterGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> CounterGuard<'a> {
    fn increment(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
