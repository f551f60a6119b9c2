//! Instance-scoped worker pool
//!
//! A fixed set of threads draining one FIFO queue guarded by a single
//! mutex/condvar pair. Workers never touch a graphics context; they exist for
//! auxiliary jobs an engine wants off its simulation thread.
//!
//! ```ignore
//! let pool = WorkerPool::new("engine#1", 4)?;
//! pool.enqueue(|| bake_navmesh())?;
//! pool.wait();
//! ```

use crate::sync::MutexExt;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("worker pool needs at least one thread")]
    NoThreads,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker pool is shut down")]
    ShutDown,
}

struct PoolState {
    queue: VecDeque<Task>,
    /// Tasks currently executing on a worker.
    active: usize,
    stopping: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Signalled when work arrives, when work completes, and on shutdown.
    signal: Condvar,
}

pub struct WorkerPool {
    name: String,
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self, WorkerPoolError> {
        if threads == 0 {
            return Err(WorkerPoolError::NoThreads);
        }

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                stopping: false,
            }),
            signal: Condvar::new(),
        });

        let pool = Self {
            name: name.to_string(),
            shared,
            workers: Mutex::new(Vec::with_capacity(threads)),
        };

        for index in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(&shared));
            match spawned {
                Ok(handle) => pool.workers.lock_or_recover().push(handle),
                Err(err) => {
                    // Joins whatever did start before reporting.
                    pool.shutdown();
                    return Err(WorkerPoolError::Spawn(err));
                }
            }
        }

        tracing::debug!(pool = %pool.name, threads, "worker pool started");
        Ok(pool)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.lock_or_recover().len()
    }

    /// Queued tasks not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.shared.state.lock_or_recover().queue.len()
    }

    /// Append a task and wake one worker.
    pub fn enqueue<F>(&self, task: F) -> Result<(), WorkerPoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock_or_recover();
            if state.stopping {
                return Err(WorkerPoolError::ShutDown);
            }
            state.queue.push_back(Box::new(task));
        }
        // One condvar serves both workers and waiters, so wake everyone.
        self.shared.signal.notify_all();
        Ok(())
    }

    /// Block until the queue is empty and no task is executing.
    pub fn wait(&self) {
        let state = self.shared.state.lock_or_recover();
        let _idle = self
            .shared
            .signal
            .wait_while(state, |s| !s.queue.is_empty() || s.active > 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock_or_recover().stopping
    }

    /// Signal every worker and join them. Tasks already queued are drained
    /// first. Safe to call more than once. Must not be called from a task.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock_or_recover();
            state.stopping = true;
        }
        self.shared.signal.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock_or_recover());
        let count = workers.len();
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked outside a task");
            }
        }
        if count > 0 {
            tracing::debug!(pool = %self.name, "worker pool stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let state = shared.state.lock_or_recover();
            let mut state = shared
                .signal
                .wait_while(state, |s| s.queue.is_empty() && !s.stopping)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match state.queue.pop_front() {
                Some(task) => {
                    state.active += 1;
                    task
                }
                // Stopping and drained
                None => return,
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!("worker task panicked");
        }

        shared.state.lock_or_recover().active -= 1;
        shared.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_all_tasks() {
        let pool = WorkerPool::new("test", 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_single_worker_is_fifo() {
        let pool = WorkerPool::new("fifo", 1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            pool.enqueue(move || order.lock().unwrap().push(i)).unwrap();
        }
        pool.wait();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            WorkerPool::new("empty", 0),
            Err(WorkerPoolError::NoThreads)
        ));
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::new("panic", 1).unwrap();
        pool.enqueue(|| panic!("task failure")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.enqueue(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.wait();
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let pool = WorkerPool::new("drain", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(pool.is_shut_down());
        assert_eq!(pool.thread_count(), 0);
        assert!(matches!(pool.enqueue(|| {}), Err(WorkerPoolError::ShutDown)));
    }
}
