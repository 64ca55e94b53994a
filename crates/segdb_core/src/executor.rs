//! Bounded worker pools shared between indexes.
//!
//! Each concern (IO, maintenance, split, registry lifecycle) runs on a fixed
//! pool of named threads fed by a bounded FIFO queue. Pools are obtained
//! through [`ExecutorRegistry`], which hands out ref-counted
//! [`ExecutorLease`]s: indexes asking for the same (name, thread count) share
//! one pool, and the pool shuts down when the last lease is dropped.

use crate::error::{IndexError, IndexResult};
use crate::types::Status;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

/// Returned when a pool refuses a task.
#[derive(Debug, Error)]
#[error("worker pool '{pool}' rejected a task ({reason})")]
pub struct TaskRejected {
    /// Pool name.
    pub pool: String,
    /// Why the task was refused.
    pub reason: &'static str,
}

type Job = Box<dyn FnOnce() + Send>;

struct PoolInner {
    name: String,
    queue: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    idle: Condvar,
    shutdown: AtomicBool,
    active: AtomicUsize,
    capacity: usize,
}

/// A fixed set of worker threads consuming a bounded queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
}

impl WorkerPool {
    /// Spawns `threads` workers named `{name}-{n}`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a thread cannot be spawned.
    pub fn new(name: &str, threads: usize, capacity: usize) -> IndexResult<Self> {
        let inner = Arc::new(PoolInner {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            capacity: capacity.max(1),
        });

        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads.max(1) {
            let worker_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || worker_loop(&worker_inner))?;
            workers.push(handle);
        }
        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();

        debug!(pool = %name, threads, "worker pool started");
        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            worker_ids,
        })
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the number of worker threads.
    pub fn threads(&self) -> usize {
        self.worker_ids.len()
    }

    /// Queues a task without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`TaskRejected`] if the queue is full or the pool is shut down.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<(), TaskRejected> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(self.rejected("shut down"));
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                return Err(self.rejected("queue full"));
            }
            queue.push_back(Box::new(work));
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Waits until the queue is empty and no task is running.
    ///
    /// Returns false if `timeout` expired first.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.active.load(Ordering::Acquire) > 0 {
            if self.inner.idle.wait_until(&mut queue, deadline).timed_out() {
                return queue.is_empty() && self.inner.active.load(Ordering::Acquire) == 0;
            }
        }
        true
    }

    /// Signals workers to finish the queued tasks and exit, then joins them.
    ///
    /// Joining is skipped for the calling thread when the last reference is
    /// released from inside one of this pool's own tasks.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let current = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        debug!(pool = %self.inner.name, "worker pool stopped");
    }

    /// Returns true if the calling thread is one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        self.worker_ids.contains(&std::thread::current().id())
    }

    fn rejected(&self, reason: &'static str) -> TaskRejected {
        TaskRejected {
            pool: self.inner.name.clone(),
            reason,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("threads", &self.worker_ids.len())
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    inner.active.fetch_add(1, Ordering::AcqRel);
                    break job;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            error!(
                pool = %inner.name,
                "worker task panicked: {}",
                panic.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }

        let queue = inner.queue.lock();
        if inner.active.fetch_sub(1, Ordering::AcqRel) == 1 && queue.is_empty() {
            inner.idle.notify_all();
        }
    }
}

/// Shared handle to a pool obtained from an [`ExecutorRegistry`].
#[derive(Debug, Clone)]
pub struct ExecutorLease {
    pool: Arc<WorkerPool>,
}

impl ExecutorLease {
    /// Queues a task on the leased pool.
    ///
    /// # Errors
    ///
    /// Returns [`TaskRejected`] if the pool refuses the task.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<(), TaskRejected> {
        self.pool.submit(work)
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Returns how many leases currently share this pool.
    pub fn lease_count(&self) -> usize {
        Arc::strong_count(&self.pool)
    }
}

/// Hands out shared pools keyed by name and thread count.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    pools: Mutex<HashMap<(String, usize), Weak<WorkerPool>>>,
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    pub fn global() -> &'static ExecutorRegistry {
        static GLOBAL: OnceLock<ExecutorRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ExecutorRegistry::new)
    }

    /// Leases the pool for `(name, threads)`, starting it if nobody holds it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a new pool cannot spawn its threads.
    pub fn lease(&self, name: &str, threads: usize, capacity: usize) -> IndexResult<ExecutorLease> {
        let mut pools = self.pools.lock();
        pools.retain(|_, pool| pool.strong_count() > 0);

        let key = (name.to_string(), threads);
        if let Some(pool) = pools.get(&key).and_then(Weak::upgrade) {
            return Ok(ExecutorLease { pool });
        }

        let pool = Arc::new(WorkerPool::new(name, threads, capacity)?);
        pools.insert(key, Arc::downgrade(&pool));
        Ok(ExecutorLease { pool })
    }

    /// Returns the number of pools that still have a live lease.
    pub fn active_pools(&self) -> usize {
        self.pools
            .lock()
            .values()
            .filter(|pool| pool.strong_count() > 0)
            .count()
    }
}

enum TaskSlot<T> {
    Pending,
    Done(IndexResult<T>),
    Taken,
}

struct TaskCell<T> {
    slot: Mutex<TaskSlot<T>>,
    done: Condvar,
}

/// Creates a connected completer/handle pair for one asynchronous task.
pub fn task_channel<T>() -> (TaskCompleter<T>, TaskHandle<T>) {
    let cell = Arc::new(TaskCell {
        slot: Mutex::new(TaskSlot::Pending),
        done: Condvar::new(),
    });
    (
        TaskCompleter {
            cell: Some(Arc::clone(&cell)),
        },
        TaskHandle { cell },
    )
}

/// Write side of a [`TaskHandle`]. Dropping it without completing fails the handle.
pub struct TaskCompleter<T> {
    cell: Option<Arc<TaskCell<T>>>,
}

impl<T> TaskCompleter<T> {
    /// Publishes the task result and wakes every waiter.
    pub fn complete(mut self, result: IndexResult<T>) {
        if let Some(cell) = self.cell.take() {
            publish(&cell, result);
        }
    }
}

impl<T> Drop for TaskCompleter<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            publish(
                &cell,
                Err(IndexError::OperationFailed {
                    operation: "task",
                    segment_id: None,
                    status: Status::Error,
                }),
            );
        }
    }
}

fn publish<T>(cell: &TaskCell<T>, result: IndexResult<T>) {
    let mut slot = cell.slot.lock();
    if matches!(*slot, TaskSlot::Pending) {
        *slot = TaskSlot::Done(result);
    }
    cell.done.notify_all();
}

/// Awaitable result of an asynchronous index operation.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    /// Creates a handle that is already complete.
    pub fn ready(result: IndexResult<T>) -> Self {
        let (completer, handle) = task_channel();
        completer.complete(result);
        handle
    }

    /// Returns true once the result is available.
    pub fn is_finished(&self) -> bool {
        !matches!(*self.cell.slot.lock(), TaskSlot::Pending)
    }

    /// Blocks until the task finishes and returns its result.
    ///
    /// # Errors
    ///
    /// Returns the error the task ended with.
    pub fn join(self) -> IndexResult<T> {
        let mut slot = self.cell.slot.lock();
        while matches!(*slot, TaskSlot::Pending) {
            self.cell.done.wait(&mut slot);
        }
        take(&mut slot)
    }

    /// Waits at most `timeout` for the result.
    ///
    /// Returns `Err(self)` if the task is still running so the caller can
    /// keep waiting later.
    pub fn join_timeout(self, timeout: Duration) -> Result<IndexResult<T>, Self> {
        let deadline = Instant::now() + timeout;
        {
            let mut slot = self.cell.slot.lock();
            while matches!(*slot, TaskSlot::Pending) {
                if self.cell.done.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
            if !matches!(*slot, TaskSlot::Pending) {
                return Ok(take(&mut slot));
            }
        }
        Err(self)
    }
}

fn take<T>(slot: &mut TaskSlot<T>) -> IndexResult<T> {
    match std::mem::replace(slot, TaskSlot::Taken) {
        TaskSlot::Done(result) => result,
        // join consumes the handle, so the slot is read at most once
        TaskSlot::Pending | TaskSlot::Taken => Err(IndexError::OperationFailed {
            operation: "task",
            segment_id: None,
            status: Status::Error,
        }),
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn submit_and_drain() {
        let pool = WorkerPool::new("test-drain", 2, 64).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        assert!(pool.drain(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn full_queue_rejects() {
        let pool = WorkerPool::new("test-full", 1, 1).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        pool.submit(move || {
            b.wait();
        })
        .unwrap();
        // wait for the worker to pick up the blocking task
        while pool.inner.active.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
        pool.submit(|| {}).unwrap();
        let err = pool.submit(|| {}).unwrap_err();
        assert_eq!(err.reason, "queue full");
        barrier.wait();
        assert!(pool.drain(Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let pool = WorkerPool::new("test-shutdown", 1, 8).unwrap();
        pool.shutdown();
        assert!(pool.submit(|| {}).is_err());
    }

    #[test]
    fn panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::new("test-panic", 1, 8).unwrap();
        pool.submit(|| panic!("boom")).unwrap();
        let (completer, handle) = task_channel();
        pool.submit(move || completer.complete(Ok(7))).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn leases_share_and_release_pools() {
        let registry = ExecutorRegistry::new();
        let a = registry.lease("lease-io", 2, 16).unwrap();
        let b = registry.lease("lease-io", 2, 16).unwrap();
        let c = registry.lease("lease-io", 3, 16).unwrap();

        assert!(std::ptr::eq(a.pool(), b.pool()));
        assert!(!std::ptr::eq(a.pool(), c.pool()));
        assert_eq!(a.lease_count(), 2);
        assert_eq!(registry.active_pools(), 2);

        drop(a);
        drop(b);
        assert_eq!(registry.active_pools(), 1);
        drop(c);
        assert_eq!(registry.active_pools(), 0);
    }

    #[test]
    fn dropped_completer_fails_handle() {
        let (completer, handle) = task_channel::<u32>();
        drop(completer);
        assert!(handle.join().is_err());
    }

    #[test]
    fn join_timeout_returns_pending_handle() {
        let (completer, handle) = task_channel::<u32>();
        let handle = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(!handle.is_finished());
        completer.complete(Ok(3));
        let result = handle.join_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.unwrap(), 3);
    }
}
