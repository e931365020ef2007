//! A one-shot promise built entirely on the public primitives.
//!
//! [`Promise::begin`] starts its body with `begin_async` immediately and
//! caches the outcome. Awaiters that arrive before resolution suspend via
//! `suspend_async`; awaiters that arrive after get the cached outcome
//! without suspending. The cache is why `T: Clone`: every awaiter
//! receives its own copy.

use crate::context::AmbientContext;
use crate::error::Result;
use crate::runtime::{begin_async, suspend_async, Fail, OnError, Resume};
use std::sync::{Arc, Mutex};

struct PromiseWaiter<T> {
    resume: Resume<T>,
    fail: Fail,
}

struct PromiseState<T> {
    outcome: Option<Result<T>>,
    waiters: Vec<PromiseWaiter<T>>,
}

struct PromiseShared<T> {
    state: Mutex<PromiseState<T>>,
}

/// A handle to an asynchronous computation begun eagerly, with a cached
/// result.
pub struct Promise<T> {
    shared: Arc<PromiseShared<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Begins `body` under `context` and returns the promise immediately.
    ///
    /// The body starts before this call returns (it runs up to its first
    /// suspension, per the `begin_async` contract). Failures of the body,
    /// before or after suspension, resolve the promise with the error.
    pub fn begin<B>(context: AmbientContext, body: B) -> Self
    where
        B: FnOnce() -> Result<T> + Send + 'static,
    {
        let promise = Self {
            shared: Arc::new(PromiseShared {
                state: Mutex::new(PromiseState {
                    outcome: None,
                    waiters: Vec::new(),
                }),
            }),
        };
        let err_resolver = promise.clone();
        let ok_resolver = promise.clone();
        let on_error: OnError = Box::new(move |err| err_resolver.resolve(Err(err)));
        let _status = begin_async(context, Some(on_error), move || {
            let value = body()?;
            ok_resolver.resolve(Ok(value.clone()));
            Ok(value)
        });
        promise
    }

    /// Returns the outcome, suspending the calling body until resolution.
    ///
    /// Once the promise is resolved this returns the cached outcome
    /// without suspending and may be called from any thread. While the
    /// promise is pending, the caller must be inside a `begin_async`
    /// body; cancellation of the caller's ambient scope wakes the await
    /// with a cancellation error and leaves the promise itself running.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or a cancellation error when the
    /// awaiting side's scope cancelled first.
    pub fn await_value(&self) -> Result<T> {
        if let Some(outcome) = self.try_outcome() {
            return outcome;
        }
        let shared = Arc::clone(&self.shared);
        suspend_async(move |resume, fail| {
            let mut state = shared.state.lock().unwrap();
            match &state.outcome {
                // Resolved between the fast path and here.
                Some(Ok(value)) => resume.resume(value.clone()),
                Some(Err(err)) => fail.fail(err.clone()),
                None => state.waiters.push(PromiseWaiter { resume, fail }),
            }
        })
    }

    /// Returns the cached outcome without suspending, if resolved.
    #[must_use]
    pub fn try_outcome(&self) -> Option<Result<T>> {
        self.shared.state.lock().unwrap().outcome.clone()
    }

    /// Returns true once the body has completed or failed.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.shared.state.lock().unwrap().outcome.is_some()
    }

    fn resolve(&self, outcome: Result<T>) {
        let waiters = {
            let mut state = self.shared.state.lock().unwrap();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            match &outcome {
                Ok(value) => waiter.resume.resume(value.clone()),
                Err(err) => waiter.fail.fail(err.clone()),
            }
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}
