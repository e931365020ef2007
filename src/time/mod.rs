//! Single-shot timer driver.
//!
//! The driver owns a dedicated thread and a deadline-ordered heap of
//! callbacks. Scope timeouts and delayed work items both arm entries here.
//! Disarming is by [`TimerKey`]; a disarmed entry stays in the heap until
//! its deadline naturally passes and is skipped when popped.
//!
//! Callbacks run on the driver thread, so they must be short. The users in
//! this crate either flip a flag and notify a condvar (scope cancellation)
//! or push a job onto the worker pool (delayed items).

use crate::tracing_compat::trace;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

type TimerCallback = Box<dyn FnOnce() + Send>;

/// Identifies an armed timer entry so it can be disarmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    id: u64,
}

struct TimerEntry {
    deadline: Instant,
    id: u64,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct DriverState {
    entries: BinaryHeap<TimerEntry>,
    /// Ids currently in the heap, for bounded disarm bookkeeping.
    live: HashSet<u64>,
    /// Ids disarmed while still in the heap.
    disarmed: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct DriverInner {
    state: Mutex<DriverState>,
    condvar: Condvar,
}

/// A deadline-ordered single-shot timer service backed by one thread.
pub struct TimerDriver {
    inner: Arc<DriverInner>,
}

impl TimerDriver {
    /// Creates a driver and starts its thread.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(DriverInner {
            state: Mutex::new(DriverState {
                entries: BinaryHeap::new(),
                live: HashSet::new(),
                disarmed: HashSet::new(),
                next_id: 1,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });

        let thread_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("cordon-timer".to_string())
            .spawn(move || driver_loop(&thread_inner))
            .expect("failed to spawn timer thread");

        Self { inner }
    }

    /// Returns the process-wide driver, starting it on first use.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<TimerDriver> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Arms a single-shot timer that runs `callback` on the driver thread
    /// once `after` has elapsed.
    pub fn schedule<F>(&self, after: Duration, callback: F) -> TimerKey
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + after;
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(TimerEntry {
            deadline,
            id,
            callback: Box::new(callback),
        });
        state.live.insert(id);
        drop(state);
        self.inner.condvar.notify_one();
        trace!(timer = id, delay_ms = after.as_millis() as u64, "timer armed");
        TimerKey { id }
    }

    /// Disarms a previously armed timer.
    ///
    /// Returns true if the entry had not yet fired, meaning its callback
    /// will never run.
    pub fn disarm(&self, key: TimerKey) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.live.remove(&key.id) {
            state.disarmed.insert(key.id);
            trace!(timer = key.id, "timer disarmed");
            true
        } else {
            false
        }
    }

    /// Stops the driver thread. Pending entries are dropped unfired.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.inner.condvar.notify_all();
    }
}

impl Default for TimerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn driver_loop(inner: &DriverInner) {
    let mut state = inner.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        let next_deadline = state.entries.peek().map(|entry| entry.deadline);
        match next_deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    let entry = state.entries.pop().expect("peeked entry");
                    state.live.remove(&entry.id);
                    if state.disarmed.remove(&entry.id) {
                        continue;
                    }
                    trace!(timer = entry.id, "timer fired");
                    // Run the callback without holding the driver lock, so
                    // the callback may arm or disarm timers.
                    drop(state);
                    (entry.callback)();
                    state = inner.state.lock().unwrap();
                } else {
                    let (guard, _timeout) = inner
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
            }
            None => {
                state = inner.condvar.wait(state).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay() {
        let driver = TimerDriver::new();
        let (tx, rx) = mpsc::channel();
        let armed_at = Instant::now();
        driver.schedule(Duration::from_millis(50), move || {
            tx.send(armed_at.elapsed()).unwrap();
        });
        let elapsed = rx.recv_timeout(Duration::from_secs(2)).expect("fired");
        assert!(elapsed >= Duration::from_millis(50));
    }

    #[test]
    fn disarm_prevents_firing() {
        let driver = TimerDriver::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let key = driver.schedule(Duration::from_millis(50), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(driver.disarm(key));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // A second disarm reports the entry as already gone.
        assert!(!driver.disarm(key));
    }

    #[test]
    fn earliest_deadline_fires_first() {
        let driver = TimerDriver::new();
        let (tx, rx) = mpsc::channel();
        let tx_late = tx.clone();
        driver.schedule(Duration::from_millis(120), move || {
            tx_late.send("late").unwrap();
        });
        driver.schedule(Duration::from_millis(30), move || {
            tx.send("early").unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
    }

    #[test]
    fn disarm_after_fire_is_false() {
        let driver = TimerDriver::new();
        let (tx, rx) = mpsc::channel();
        let key = driver.schedule(Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2)).expect("fired");
        // Give the driver a beat to finish the pop bookkeeping.
        thread::sleep(Duration::from_millis(20));
        assert!(!driver.disarm(key));
    }
}
