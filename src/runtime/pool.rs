//! Worker pool that runs asynchronous bodies and delayed actions.
//!
//! Workers are plain OS threads fed from a shared injector queue. Because
//! the suspension primitives park a worker for the lifetime of a blocked
//! body, the pool grows on demand: whenever every live worker is occupied
//! and work is pending, a new thread is spawned up to the ceiling. Idle
//! workers above the floor retire after a quiet period.

use crate::tracing_compat::{debug, trace};
use crossbeam_queue::SegQueue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default idle timeout before retiring excess workers.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default worker ceiling. Each blocked suspension occupies one worker, so
/// the ceiling bounds the depth-times-width of concurrently parked bodies.
const DEFAULT_CEILING: usize = 256;

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    /// Workers kept alive even when idle.
    pub floor: usize,
    /// Maximum number of workers.
    pub ceiling: usize,
    /// Quiet period after which workers above the floor retire.
    pub idle_timeout: Duration,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            floor: 0,
            ceiling: DEFAULT_CEILING,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "cordon".to_string(),
        }
    }
}

struct PoolInner {
    floor: usize,
    ceiling: usize,
    active: AtomicUsize,
    busy: AtomicUsize,
    pending: AtomicUsize,
    next_worker: AtomicUsize,
    queue: SegQueue<Job>,
    shutdown: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
    idle_timeout: Duration,
    thread_name_prefix: String,
}

/// A demand-grown pool of worker threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool with the given options, eagerly spawning the floor.
    #[must_use]
    pub fn new(options: WorkerPoolOptions) -> Self {
        assert!(options.ceiling > 0, "worker ceiling must be at least 1");
        let ceiling = options.ceiling.max(options.floor);
        let inner = Arc::new(PoolInner {
            floor: options.floor,
            ceiling,
            active: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            next_worker: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            idle_timeout: options.idle_timeout,
            thread_name_prefix: options.thread_name_prefix,
        });
        let pool = Self { inner };
        for _ in 0..options.floor {
            spawn_worker(&pool.inner);
        }
        pool
    }

    /// Returns the process-wide pool, creating it with defaults on first
    /// use. Use [`configure`](Self::configure) to install custom options
    /// before any work is submitted.
    pub fn global() -> &'static Self {
        global_cell().get_or_init(|| Self::new(WorkerPoolOptions::default()))
    }

    /// Installs options for the process-wide pool.
    ///
    /// Returns false if the pool was already created, in which case the
    /// options are discarded.
    pub fn configure(options: WorkerPoolOptions) -> bool {
        global_cell().set(Self::new(options)).is_ok()
    }

    /// Submits a job. Wakes a parked worker or spawns a new one when every
    /// live worker is occupied.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            !self.inner.shutdown.load(Ordering::Acquire),
            "submit on a shut-down worker pool"
        );
        self.inner.queue.push(Box::new(job));
        self.inner.pending.fetch_add(1, Ordering::Relaxed);
        maybe_spawn_worker(&self.inner);
        let _guard = self.inner.mutex.lock().unwrap();
        self.inner.condvar.notify_one();
    }

    /// Returns the number of live workers.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Returns the number of workers currently running or parked in a job.
    #[must_use]
    pub fn busy_workers(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Returns the number of jobs waiting in the injector.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.inner.pending.load(Ordering::Relaxed)
    }

    /// Stops accepting work and lets workers drain and exit.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock().unwrap();
        self.inner.condvar.notify_all();
    }
}

fn global_cell() -> &'static OnceLock<WorkerPool> {
    static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();
    &GLOBAL
}

fn spawn_worker(inner: &Arc<PoolInner>) {
    let worker_inner = Arc::clone(inner);
    let worker_id = inner.next_worker.fetch_add(1, Ordering::Relaxed);
    inner.active.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", inner.thread_name_prefix, worker_id);
    debug!(worker = worker_id, "spawning worker");
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            worker_loop(&worker_inner);
            worker_inner.active.fetch_sub(1, Ordering::Relaxed);
            trace!(worker = worker_id, "worker retired");
        })
        .expect("failed to spawn worker thread");
}

fn maybe_spawn_worker(inner: &Arc<PoolInner>) {
    let active = inner.active.load(Ordering::Relaxed);
    let busy = inner.busy.load(Ordering::Relaxed);
    let pending = inner.pending.load(Ordering::Relaxed);
    // Grow when pending work exceeds the idle workers able to absorb it.
    // Parked suspensions keep workers busy indefinitely, so erring toward
    // an extra thread is the liveness-preserving direction.
    if active < inner.ceiling && pending > active.saturating_sub(busy) {
        spawn_worker(inner);
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.pending.fetch_sub(1, Ordering::Relaxed);
            inner.busy.fetch_add(1, Ordering::Relaxed);
            // A panicking job must not take the worker down with it; the
            // submitter observes the panic through its own wrapper.
            let _ = catch_unwind(AssertUnwindSafe(job));
            inner.busy.fetch_sub(1, Ordering::Relaxed);
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let guard = inner.mutex.lock().unwrap();
        if !inner.queue.is_empty() || inner.shutdown.load(Ordering::Acquire) {
            continue;
        }
        let (guard, timeout) = inner
            .condvar
            .wait_timeout(guard, inner.idle_timeout)
            .unwrap();
        drop(guard);
        if timeout.timed_out()
            && inner.queue.is_empty()
            && inner.active.load(Ordering::Relaxed) > inner.floor
        {
            return;
        }
    }
}
