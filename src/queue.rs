//! Delayed-work adapter.
//!
//! A [`WorkQueue`] schedules actions to run after a delay. Each scheduled
//! action is represented by a [`DelayedItem`], which is a [`Cancellable`]
//! and is normally registered with the ambient [`CancelScope`] so a scope
//! cancellation stops work that has not fired yet.
//!
//! Bodies discover the queue through the ambient context rather than a
//! global: put a queue into the context handed to `begin_async` and call
//! [`WorkQueue::ambient`] from inside suspension callbacks.
//!
//! The action runs on a worker-pool thread under the scheduling
//! computation's captured [`CoroutineState`], so context lookups inside
//! the action see the originating body's context even though the timer
//! hopped threads.

use crate::cancel::Cancellable;
use crate::error::{Error, ErrorKind};
use crate::runtime::{CoroutineState, WorkerPool};
use crate::time::{TimerDriver, TimerKey};
use crate::tracing_compat::{debug, trace};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Errors from the work-queue adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue was closed; no further items are accepted.
    #[error("work queue is closed")]
    Closed,
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Error::new(ErrorKind::QueueClosed).with_source(err)
    }
}

struct QueueShared {
    closed: AtomicBool,
    outstanding: AtomicUsize,
}

/// Schedules delayed actions as cancellable items.
///
/// Cloning is cheap; clones share the same queue state.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<QueueShared>,
}

impl WorkQueue {
    /// Creates an open queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                closed: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the queue carried by the current body's ambient context.
    #[must_use]
    pub fn ambient() -> Option<Arc<Self>> {
        crate::context::get_context::<Self>()
    }

    /// Schedules `action` to run on a worker once `delay` has elapsed.
    ///
    /// The returned item can be registered with a cancel scope; cancelling
    /// it before the delay elapses disarms the timer and the action never
    /// runs. The action executes under the `CoroutineState` captured here,
    /// so it observes the scheduling body's ambient context.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once [`close`](Self::close) has run.
    pub fn schedule_after<F>(
        &self,
        delay: Duration,
        action: F,
    ) -> Result<Arc<DelayedItem>, QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let state = CoroutineState::capture();
        let item = Arc::new(DelayedItem {
            cancelled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            timer: Mutex::new(None),
            queue: Arc::clone(&self.shared),
        });
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);

        let fire_item = Arc::clone(&item);
        let fire_queue = Arc::clone(&self.shared);
        let key = TimerDriver::global().schedule(delay, move || {
            // The entry has left the timer whether or not it still runs.
            fire_queue.outstanding.fetch_sub(1, Ordering::SeqCst);
            if fire_item.cancelled.load(Ordering::SeqCst) {
                trace!("delayed item fired after cancellation, dropping");
                return;
            }
            fire_item.fired.store(true, Ordering::SeqCst);
            WorkerPool::global().submit(move || state.run(action));
        });
        *item.timer.lock().unwrap() = Some(key);
        debug!(delay_ms = delay.as_millis() as u64, "delayed item scheduled");
        Ok(item)
    }

    /// Returns the number of items armed but not yet fired or disarmed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Closes the queue. Already-armed items still fire; new scheduling
    /// is rejected.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Returns true once the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("closed", &self.is_closed())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// One scheduled action, cancellable until it fires.
pub struct DelayedItem {
    cancelled: AtomicBool,
    fired: AtomicBool,
    timer: Mutex<Option<TimerKey>>,
    queue: Arc<QueueShared>,
}

impl DelayedItem {
    /// Returns true once the action has been handed to a worker.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Cancellable for DelayedItem {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let key = self.timer.lock().unwrap().take();
        if let Some(key) = key {
            if TimerDriver::global().disarm(key) {
                // The fire callback will never run for this entry.
                self.queue.outstanding.fetch_sub(1, Ordering::SeqCst);
                trace!("delayed item disarmed");
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for DelayedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedItem")
            .field("cancelled", &self.is_cancelled())
            .field("fired", &self.has_fired())
            .finish()
    }
}
