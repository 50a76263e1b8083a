//! Bounded worker pools.
//!
//! # Responsibilities
//! - Run packet handlers and TLS delegated tasks off the selector thread
//! - Bound the number of threads per pool
//! - Isolate panics so one bad task cannot take a thread down
//!
//! # Design Decisions
//! - Backed by a Tokio runtime's blocking pool (`max_blocking_threads`)
//! - Size 0 means "run inline on the calling thread"
//! - Shutting down (or dropping) the pool does not wait on running tasks;
//!   tasks submitted afterwards are dropped

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};

/// A fixed-size pool for short, synchronous tasks.
pub struct WorkerPool {
    name: String,
    threads: usize,
    runtime: Mutex<Option<Runtime>>,
}

impl WorkerPool {
    /// Create a pool named `name` with at most `threads` threads.
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        if threads == 0 {
            return Ok(Self::inline(name));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name(name)
            .build()?;

        tracing::debug!(pool = name, threads, "Worker pool started");
        Ok(Self {
            name: name.to_string(),
            threads,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// A pool that runs every task on the calling thread.
    pub fn inline(name: &str) -> Self {
        Self {
            name: name.to_string(),
            threads: 0,
            runtime: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_inline(&self) -> bool {
        self.threads == 0
    }

    pub fn is_shut_down(&self) -> bool {
        !self.is_inline() && self.runtime.lock().is_none()
    }

    /// Run `task` on the pool, or inline when the pool has no threads.
    ///
    /// Returns `false` if the pool has been shut down and `task` was dropped.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_inline() {
            run_guarded(&self.name, task);
            return true;
        }
        match self.runtime.lock().as_ref() {
            Some(runtime) => {
                let name = self.name.clone();
                runtime.spawn_blocking(move || run_guarded(&name, task));
                true
            }
            None => {
                tracing::trace!(pool = %self.name, "Pool shut down, dropping task");
                false
            }
        }
    }

    /// Stop accepting tasks. Queued tasks that have not started are
    /// discarded; running ones are not waited on. Idempotent.
    pub fn shutdown(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            tracing::debug!(pool = %self.name, "Worker pool stopped");
        }
    }
}

fn run_guarded<F: FnOnce()>(pool: &str, task: F) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!(pool, "Task panicked");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn inline_pool_runs_on_caller() {
        let pool = WorkerPool::new("inline-test", 0).unwrap();
        assert!(pool.is_inline());

        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(std::thread::current().id()).unwrap());
        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn threaded_pool_runs_elsewhere() {
        let pool = WorkerPool::new("pool-test", 2).unwrap();
        let caller = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let tx = tx.clone();
            pool.execute(move || tx.send(std::thread::current().id()).unwrap());
        }
        for _ in 0..8 {
            let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_ne!(id, caller);
        }
    }

    #[test]
    fn panics_are_contained() {
        let pool = WorkerPool::new("panic-test", 0).unwrap();
        pool.execute(|| panic!("handler bug"));

        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(()).unwrap());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn shut_down_pool_drops_new_tasks() {
        let pool = WorkerPool::new("shutdown-test", 2).unwrap();
        let (tx, rx) = mpsc::channel();
        let early = tx.clone();
        assert!(pool.execute(move || early.send("before").unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "before");

        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(!pool.execute(move || tx.send("after").unwrap()));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn inline_pool_is_never_shut_down() {
        let pool = WorkerPool::inline("inline-shutdown");
        pool.shutdown();
        assert!(!pool.is_shut_down());
        assert!(pool.execute(|| {}));
    }
}
