//! Bounded worker pool used as the overflow path of the delivery pipeline.
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::relay_error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Prefix of the names given to pool threads.
pub(crate) const THREAD_NAME_PREFIX: &str = "OpenTelemetry.Relay.FlushPool.";

/// Reasons a job was refused by [`WorkerPool::try_submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every worker slot is taken.
    Full,
    /// The pool was shut down.
    Closed,
}

// Jobs accepted and not finished yet, with a condition variable signalled
// whenever the count drops to zero.
#[derive(Default)]
struct Slots {
    running: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl Slots {
    fn release(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.running.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            guard = self
                .idle
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Fixed-size pool of named worker threads.
///
/// The pool accepts at most `capacity` jobs at a time, counting both the jobs
/// being executed and the ones waiting for a free thread. Submission never
/// blocks: a job that does not fit is refused with [`PoolError::Full`].
pub struct WorkerPool {
    capacity: usize,
    slots: Arc<Slots>,
    task_sender: Mutex<Option<mpsc::SyncSender<Job>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("running", &self.running())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool with `capacity` worker threads. A capacity of zero
    /// creates a pool that refuses every job.
    pub fn new(capacity: usize) -> Self {
        // Jobs queued plus jobs running never exceed `capacity`, so the channel
        // itself can never be the reason a submission fails.
        let (task_sender, task_receiver) = mpsc::sync_channel::<Job>(capacity.max(1));
        let task_receiver = Arc::new(Mutex::new(task_receiver));
        let slots = Arc::new(Slots::default());

        let mut handles = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let task_receiver = Arc::clone(&task_receiver);
            let slots = Arc::clone(&slots);
            let spawned = thread::Builder::new()
                .name(format!("{THREAD_NAME_PREFIX}{index}"))
                .spawn(move || Self::worker_loop(task_receiver, slots));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    relay_error!(
                        name: "WorkerPool.ThreadStartError",
                        error = format!("{:?}", e)
                    );
                }
            }
        }

        WorkerPool {
            capacity: handles.len(),
            slots,
            task_sender: Mutex::new(Some(task_sender)),
            handles: Mutex::new(handles),
        }
    }

    fn worker_loop(task_receiver: Arc<Mutex<mpsc::Receiver<Job>>>, slots: Arc<Slots>) {
        loop {
            let task = task_receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv();
            let Ok(task) = task else {
                // Sender dropped: the pool is shutting down.
                break;
            };
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                relay_error!(name: "WorkerPool.TaskPanicked");
            }
            slots.release();
        }
    }

    /// Hands `job` to a worker if a slot is free. Never blocks.
    pub fn try_submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut current = self.slots.running.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return Err(PoolError::Full);
            }
            match self.slots.running.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let sent = match self
            .task_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(sender) => sender.try_send(Box::new(job)).map_err(|e| match e {
                mpsc::TrySendError::Full(_) => PoolError::Full,
                mpsc::TrySendError::Disconnected(_) => PoolError::Closed,
            }),
            None => Err(PoolError::Closed),
        };
        if sent.is_err() {
            self.slots.release();
        }
        sent
    }

    /// Number of jobs accepted and not yet finished.
    pub fn running(&self) -> usize {
        self.slots.running.load(Ordering::Acquire)
    }

    /// Number of jobs that can still be accepted right now.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.running())
    }

    /// Maximum number of jobs in flight.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stops accepting jobs without waiting for the accepted ones. The worker
    /// threads are detached and exit once their current job returns.
    pub fn close(&self) {
        self.stop_accepting();
        drop(self.take_handles());
    }

    /// Stops accepting jobs, lets the accepted ones finish and joins the
    /// worker threads. Calling it again is a no-op.
    pub fn shutdown(&self) {
        self.stop_accepting();
        for handle in self.take_handles() {
            if handle.join().is_err() {
                relay_error!(name: "WorkerPool.ThreadJoinError");
            }
        }
    }

    /// Stops accepting jobs and waits up to `timeout` for the accepted ones.
    ///
    /// Returns `true` and joins the worker threads if every job finished in
    /// time. Otherwise the threads are detached as in
    /// [`close`](WorkerPool::close) and `false` is returned.
    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        self.stop_accepting();
        if !self.slots.wait_idle(timeout) {
            drop(self.take_handles());
            return false;
        }
        self.shutdown();
        true
    }

    fn stop_accepting(&self) {
        drop(
            self.task_sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }

    fn take_handles(&self) -> Vec<thread::JoinHandle<()>> {
        std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{PoolError, WorkerPool};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Barrier};
    use std::time::{Duration, Instant};

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..2 {
            let done = done.clone();
            let tx = tx.clone();
            pool.try_submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
        }

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn refuses_jobs_beyond_capacity_without_blocking() {
        let capacity = 3;
        let pool = WorkerPool::new(capacity);
        let release = Arc::new(Barrier::new(capacity + 1));

        for _ in 0..capacity {
            let release = release.clone();
            pool.try_submit(move || {
                release.wait();
            })
            .unwrap();
        }

        assert_eq!(pool.running(), capacity);
        assert_eq!(pool.free(), 0);
        assert_eq!(pool.try_submit(|| {}), Err(PoolError::Full));
        assert_eq!(pool.try_submit(|| {}), Err(PoolError::Full));

        release.wait();
        pool.shutdown();
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.free(), capacity);
    }

    #[test]
    fn slot_is_released_after_panicking_job() {
        let pool = WorkerPool::new(1);
        pool.try_submit(|| panic!("job failure")).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut accepted = false;
        for _ in 0..500 {
            let tx = tx.clone();
            if pool.try_submit(move || tx.send(()).unwrap()).is_ok() {
                accepted = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(accepted);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let pool = WorkerPool::new(2);
        pool.shutdown();
        assert_eq!(pool.try_submit(|| {}), Err(PoolError::Closed));
        pool.shutdown();
    }

    #[test]
    fn close_does_not_wait_for_running_jobs() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.try_submit(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();

        pool.close();
        assert_eq!(pool.try_submit(|| {}), Err(PoolError::Closed));
        release_tx.send(()).unwrap();
    }

    #[test]
    fn shutdown_timeout_joins_finished_jobs() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = mpsc::channel();
        pool.try_submit(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(pool.shutdown_timeout(Duration::from_secs(5)));
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.try_submit(|| {}), Err(PoolError::Closed));
    }

    #[test]
    fn shutdown_timeout_gives_up_on_stuck_jobs() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.try_submit(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
        })
        .unwrap();

        let start = Instant::now();
        assert!(!pool.shutdown_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.running(), 1);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn zero_capacity_pool_refuses_everything() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.try_submit(|| {}), Err(PoolError::Full));
    }
}
