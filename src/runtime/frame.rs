//! Suspension frames and their resumption handles.
//!
//! A frame is the transient state of one parked `suspend_async` call: a
//! value slot, an error slot, and a completion signal the parked worker
//! blocks on. The resolution rules are asymmetric on purpose:
//!
//! - a value may be recorded once;
//! - `Cancelled` may be recorded any number of times;
//! - at most one non-cancellation error may be recorded, and it replaces a
//!   previously recorded `Cancelled` (the work failed for a real reason,
//!   cancellation was moot);
//! - a real outcome arriving after `Cancelled` wins the race.
//!
//! The first recording wakes the parked worker. Later permitted recordings
//! only mutate the slots and never wake again.

use crate::error::{Error, Result};
use crate::tracing_compat::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A one-shot done flag a thread can block on.
pub(crate) struct Completion {
    done: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        self.done.store(true, Ordering::Release);
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.mutex.lock().unwrap();
        while !self.done.load(Ordering::Acquire) {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    pub(crate) fn is_signalled(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

struct FrameState<T> {
    value: Option<T>,
    error: Option<Error>,
    /// Sticky markers for misuse detection; unlike the slots above they
    /// survive `take_outcome`, so a late duplicate delivery still trips
    /// the right assertion.
    value_recorded: bool,
    real_error_recorded: bool,
    woken: bool,
}

/// State of one parked suspension.
pub(crate) struct SuspensionFrame<T> {
    state: Mutex<FrameState<T>>,
    completion: Completion,
}

impl<T: Send + 'static> SuspensionFrame<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FrameState {
                value: None,
                error: None,
                value_recorded: false,
                real_error_recorded: false,
                woken: false,
            }),
            completion: Completion::new(),
        }
    }

    /// Records the resumption value. Panics on a second value or after a
    /// non-cancellation failure; both are programmer errors.
    pub(crate) fn record_value(&self, value: T) {
        let wake = {
            let mut state = self.state.lock().unwrap();
            assert!(
                !state.value_recorded,
                "resume on an already-resumed suspension"
            );
            assert!(
                !state.real_error_recorded,
                "resume after the suspension failed with a non-cancellation error"
            );
            // The real outcome supersedes any recorded cancellation.
            state.error = None;
            state.value = Some(value);
            state.value_recorded = true;
            first_wake(&mut state)
        };
        if wake {
            self.completion.signal();
        }
    }

    /// Records a failure, applying the precedence rules above.
    pub(crate) fn record_error(&self, error: Error) {
        let wake = {
            let mut state = self.state.lock().unwrap();
            if error.is_cancelled() {
                // Cancellation of an already-resolved frame is moot.
                if state.value_recorded || state.real_error_recorded {
                    return;
                }
                state.error = Some(error);
            } else {
                assert!(
                    !state.value_recorded,
                    "fail on an already-resumed suspension"
                );
                assert!(
                    !state.real_error_recorded,
                    "suspension failed twice with non-cancellation errors"
                );
                state.error = Some(error);
                state.real_error_recorded = true;
            }
            first_wake(&mut state)
        };
        if wake {
            self.completion.signal();
        }
    }

    /// Parks the calling thread until the first recording.
    pub(crate) fn wait(&self) {
        self.completion.wait();
    }

    /// Consumes the recorded outcome after a wake.
    pub(crate) fn take_outcome(&self) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        if let Some(value) = state.value.take() {
            return Ok(value);
        }
        Err(state
            .error
            .take()
            .expect("suspension woke without a recorded outcome"))
    }
}

fn first_wake<T>(state: &mut FrameState<T>) -> bool {
    if state.woken {
        false
    } else {
        state.woken = true;
        true
    }
}

/// Internal error-delivery hook shared by [`Fail`] handles and scope
/// failure closures. Type-erased so a scope can hold failure routes to
/// frames of differing value types.
pub(crate) trait ErrorSink: Send + Sync {
    fn deliver(&self, error: Error);
}

impl<T: Send + 'static> ErrorSink for SuspensionFrame<T> {
    fn deliver(&self, error: Error) {
        self.record_error(error);
    }
}

/// Delivers the resumption value of a suspended operation.
///
/// Handed to the operation closure of `suspend_async`; clone it into
/// whatever callback will eventually produce the value. Calling
/// [`resume`](Self::resume) twice is a fatal programmer error.
pub struct Resume<T> {
    frame: Arc<SuspensionFrame<T>>,
}

impl<T: Send + 'static> Resume<T> {
    pub(crate) fn new(frame: Arc<SuspensionFrame<T>>) -> Self {
        Self { frame }
    }

    /// Delivers the value and wakes the suspended body.
    ///
    /// May be called from any thread. If the suspension was cancelled
    /// concurrently, the value still wins and is what the body observes.
    pub fn resume(&self, value: T) {
        trace!("suspension resumed");
        self.frame.record_value(value);
    }
}

impl<T> Clone for Resume<T> {
    fn clone(&self) -> Self {
        Self {
            frame: Arc::clone(&self.frame),
        }
    }
}

impl<T> std::fmt::Debug for Resume<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resume").finish_non_exhaustive()
    }
}

/// Delivers a failure to a suspended operation.
///
/// `Cancelled` errors may be delivered repeatedly; at most one real error
/// may follow, and it supersedes any recorded cancellation.
#[derive(Clone)]
pub struct Fail {
    sink: Arc<dyn ErrorSink>,
}

impl Fail {
    pub(crate) fn new(sink: Arc<dyn ErrorSink>) -> Self {
        Self { sink }
    }

    /// Delivers the error and wakes the suspended body on first delivery.
    pub fn fail(&self, error: Error) {
        trace!(cancelled = error.is_cancelled(), "suspension failed");
        self.sink.deliver(error);
    }
}

impl std::fmt::Debug for Fail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fail").finish_non_exhaustive()
    }
}
