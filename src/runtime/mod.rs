//! Direct-style asynchronous primitives over a blocking handoff.
//!
//! [`begin_async`] schedules a body onto the worker pool under a merged
//! ambient context and parks the caller until the body completes or first
//! suspends. [`suspend_async`] parks the body's worker until a callback
//! delivers an outcome, routing cancellation through the ambient
//! [`CancelScope`] when one is present.
//!
//! The handoff blocks real threads. That is the accepted cost of this
//! design: the contract exposed to bodies and adapters (return no later
//! than first suspension, resumption from any thread, context inheritance)
//! is the stable part, and a coroutine-based implementation could honor
//! it without any caller-visible change.

mod frame;
mod pool;

pub use frame::{Fail, Resume};
pub use pool::{WorkerPool, WorkerPoolOptions};

use crate::cancel::CancelScope;
use crate::context::AmbientContext;
use crate::error::{Error, Result};
use crate::tracing_compat::{debug, error, trace};
use frame::{Completion, SuspensionFrame};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Error handler invoked once with the body's failure, whether the body
/// failed before or after its first suspension.
pub type OnError = Box<dyn FnOnce(Error) + Send + 'static>;

/// What `begin_async` observed by the time it returned.
#[derive(Debug)]
pub enum BeginStatus<T> {
    /// The body ran to completion without suspending.
    Completed(T),
    /// The body failed without suspending. The same error was also
    /// delivered to `on_error`, when one was supplied.
    Failed(Error),
    /// The body reached its first suspension and continues on its worker.
    Suspended,
}

impl<T> BeginStatus<T> {
    /// Returns the completed value, if the body finished synchronously.
    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Returns true when the body reached its first suspension.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended)
    }
}

/// Ambient state of the asynchronous body executing on this thread.
#[derive(Clone)]
struct TaskState {
    context: AmbientContext,
    completion: Arc<Completion>,
}

thread_local! {
    static CURRENT: RefCell<Option<TaskState>> = const { RefCell::new(None) };
}

fn current_task() -> Option<TaskState> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Returns the context installed for the body executing on this thread,
/// or an empty context outside any body.
pub(crate) fn current_context() -> AmbientContext {
    current_task().map_or_else(AmbientContext::empty, |task| task.context)
}

struct TaskGuard {
    previous: Option<TaskState>,
}

fn install_task(state: TaskState) -> TaskGuard {
    let previous = CURRENT.with(|cell| cell.borrow_mut().replace(state));
    TaskGuard { previous }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// A snapshot of the ambient task state, for callbacks that hop threads.
///
/// A callback scheduled on a timer or foreign thread runs without the
/// originating body's thread-local state. Capture a `CoroutineState`
/// where the state is still installed and [`run`](Self::run) the callback
/// under it; context lookups inside then see the originating body's
/// context.
#[derive(Clone)]
pub struct CoroutineState {
    saved: Option<TaskState>,
}

impl CoroutineState {
    /// Captures the state installed on the current thread, if any.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            saved: current_task(),
        }
    }

    /// Runs `f` with the captured state installed, restoring the thread's
    /// prior state afterwards.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.saved {
            Some(state) => {
                let _guard = install_task(state.clone());
                f()
            }
            None => f(),
        }
    }
}

impl std::fmt::Debug for CoroutineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineState")
            .field("captured", &self.saved.is_some())
            .finish()
    }
}

/// Installs options for the process-wide worker pool.
///
/// Returns false when the pool already exists, in which case the options
/// are discarded.
pub fn configure_workers(options: WorkerPoolOptions) -> bool {
    WorkerPool::configure(options)
}

struct BeginShared<T> {
    completion: Arc<Completion>,
    outcome: Mutex<Option<Result<T>>>,
}

/// Begins an asynchronous body and returns at its first suspension point.
///
/// The body runs on a worker under `context` merged with the context of
/// the calling body, if any; inner elements shadow outer ones, and outer
/// elements stay visible for types the inner context does not provide.
///
/// The return value reports what had happened by the time the caller was
/// released:
///
/// - [`BeginStatus::Completed`] when the body finished without suspending;
/// - [`BeginStatus::Failed`] when it failed without suspending, in which
///   case `on_error` has also been invoked with the same error;
/// - [`BeginStatus::Suspended`] when it reached a suspension and continues
///   asynchronously. A failure after this point is delivered to
///   `on_error` only.
///
/// `on_error` is invoked at most once in every case.
pub fn begin_async<T, B>(
    context: AmbientContext,
    on_error: Option<OnError>,
    body: B,
) -> BeginStatus<T>
where
    T: Send + 'static,
    B: FnOnce() -> Result<T> + Send + 'static,
{
    let merged = AmbientContext::merge(&context, &current_context());
    let completion = Arc::new(Completion::new());
    let shared = Arc::new(BeginShared::<T> {
        completion: Arc::clone(&completion),
        outcome: Mutex::new(None),
    });
    let task = TaskState {
        context: merged,
        completion: Arc::clone(&completion),
    };

    let worker_shared = Arc::clone(&shared);
    WorkerPool::global().submit(move || {
        let _guard = install_task(task);
        trace!("async body starting");
        let result = match catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => result,
            Err(_panic) => Err(Error::internal("asynchronous body panicked")),
        };
        if worker_shared.completion.is_signalled() {
            // The caller was released at the first suspension; failures
            // from here on reach the error handler only.
            if let Err(err) = result {
                debug!(error = %err, "suspended body failed");
                match on_error {
                    Some(handler) => handler(err),
                    None => error!(error = %err, "async body failed with no error handler"),
                }
            }
        } else {
            if let Err(err) = &result {
                if let Some(handler) = on_error {
                    handler(err.clone());
                }
            }
            *worker_shared.outcome.lock().unwrap() = Some(result);
            worker_shared.completion.signal();
        }
    });

    shared.completion.wait();
    let outcome = shared.outcome.lock().unwrap().take();
    match outcome {
        Some(Ok(value)) => BeginStatus::Completed(value),
        Some(Err(err)) => BeginStatus::Failed(err),
        None => BeginStatus::Suspended,
    }
}

struct FrameGuard {
    scope: CancelScope,
    tag: crate::cancel::FrameTag,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.scope.resolve_frame(self.tag);
    }
}

/// Suspends the current body until a callback delivers an outcome.
///
/// `op` receives a [`Resume`] and a [`Fail`] handle, starts the
/// underlying work, and returns; the body then parks until one of the
/// handles fires. When the ambient context carries a [`CancelScope`],
/// this suspension's failure route is pushed onto it for the duration of
/// the park, so cancelling the scope wakes this exact awaiter with a
/// cancellation error. Items the operation registers with the scope are
/// pruned when the suspension resolves.
///
/// A concurrent cancellation loses to a real outcome: if the underlying
/// work delivers a value or a genuine error after the scope cancelled,
/// the real outcome is what this call returns.
///
/// # Errors
///
/// Returns whatever error the operation delivered through [`Fail`], or a
/// cancellation error when the scope cancelled first.
///
/// # Panics
///
/// Panics when called outside a `begin_async` body.
pub fn suspend_async<T, F>(op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Resume<T>, Fail),
{
    let task = current_task()
        .expect("suspend_async requires an enclosing begin_async body");
    let scope = task.context.get::<CancelScope>();

    let frame = Arc::new(SuspensionFrame::<T>::new());
    let resume = Resume::new(Arc::clone(&frame));
    let fail = Fail::new(Arc::clone(&frame) as Arc<dyn frame::ErrorSink>);

    let _frame_guard = scope.map(|scope| {
        let route = fail.clone();
        let tag = scope
            .push_failure_handler(Arc::new(move |err| route.fail(err)));
        FrameGuard {
            scope: (*scope).clone(),
            tag,
        }
    });

    op(resume, fail);

    // Release the begin_async caller: the body has reached a suspension.
    task.completion.signal();
    trace!("body suspended");
    frame.wait();
    trace!("body woken");
    drop(_frame_guard);
    frame.take_outcome()
}

/// Suspends the current body until `resume` delivers a value.
///
/// This variant takes no part in cancellation: no scope is consulted, no
/// failure route is pushed, and the operation has no way to fail the
/// suspension. Use it for callbacks that always complete.
///
/// # Panics
///
/// Panics when called outside a `begin_async` body.
pub fn suspend_async_unscoped<T, F>(op: F) -> T
where
    T: Send + 'static,
    F: FnOnce(Resume<T>),
{
    let task = current_task()
        .expect("suspend_async_unscoped requires an enclosing begin_async body");
    let frame = Arc::new(SuspensionFrame::<T>::new());
    op(Resume::new(Arc::clone(&frame)));
    task.completion.signal();
    frame.wait();
    frame
        .take_outcome()
        .unwrap_or_else(|_| unreachable!("unscoped suspension has no failure route"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn synchronous_completion() {
        let status = begin_async(AmbientContext::empty(), None, || Ok(21 * 2));
        assert_eq!(status.completed(), Some(42));
    }

    #[test]
    fn synchronous_failure_surfaces_and_notifies() {
        let (tx, rx) = mpsc::channel();
        let on_error: OnError = Box::new(move |err| tx.send(err).unwrap());
        let status = begin_async::<i32, _>(AmbientContext::empty(), Some(on_error), || {
            Err(Error::adapter("refused"))
        });
        match status {
            BeginStatus::Failed(err) => assert_eq!(err.kind(), ErrorKind::Adapter),
            other => panic!("expected Failed, got {other:?}"),
        }
        let notified = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(notified.kind(), ErrorKind::Adapter);
    }

    #[test]
    fn returns_at_first_suspension() {
        let (done_tx, done_rx) = mpsc::channel();
        let status = begin_async(AmbientContext::empty(), None, move || {
            let value = suspend_async_unscoped(|resume| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(30));
                    resume.resume(7);
                });
            });
            done_tx.send(value).unwrap();
            Ok(value)
        });
        assert!(status.is_suspended());
        // The body resumed and ran to completion after we were released.
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    }

    #[test]
    fn failure_after_suspension_goes_to_handler_only() {
        let (tx, rx) = mpsc::channel();
        let on_error: OnError = Box::new(move |err| tx.send(err).unwrap());
        let status = begin_async::<i32, _>(AmbientContext::empty(), Some(on_error), || {
            suspend_async_unscoped(|resume| {
                thread::spawn(move || resume.resume(()));
            });
            Err(Error::adapter("late failure"))
        });
        assert!(status.is_suspended());
        let err = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(err.kind(), ErrorKind::Adapter);
    }

    #[test]
    fn context_is_inherited_and_shadowed() {
        struct Depth(usize);
        struct OuterOnly(&'static str);

        let outer_cx = AmbientContext::value(Depth(1)).with(OuterOnly("kept"));
        let (tx, rx) = mpsc::channel();
        let status = begin_async(outer_cx, None, move || {
            let inner = begin_async(AmbientContext::value(Depth(2)), None, move || {
                let depth = crate::context::get_context::<Depth>().unwrap().0;
                let outer = crate::context::get_context::<OuterOnly>().unwrap().0;
                tx.send((depth, outer)).unwrap();
                Ok(())
            });
            assert!(inner.completed().is_some());
            Ok(())
        });
        assert!(status.completed().is_some());
        let (depth, outer) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(depth, 2, "inner value shadows outer");
        assert_eq!(outer, "kept", "outer-only type stays visible");
    }

    #[test]
    fn coroutine_state_restores_context_across_threads() {
        struct Marker(u32);
        let (tx, rx) = mpsc::channel();
        let status = begin_async(AmbientContext::value(Marker(9)), None, move || {
            let snapshot = CoroutineState::capture();
            let value = suspend_async_unscoped(move |resume| {
                thread::spawn(move || {
                    let seen = snapshot
                        .run(|| crate::context::get_context::<Marker>().map(|m| m.0));
                    resume.resume(seen);
                });
            });
            tx.send(value).unwrap();
            Ok(())
        });
        assert!(status.is_suspended());
        let seen = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(seen, Some(9));
    }

    #[test]
    #[should_panic(expected = "requires an enclosing begin_async")]
    fn suspend_outside_body_panics() {
        let _ = suspend_async::<(), _>(|_resume, _fail| {});
    }

    #[test]
    fn body_panic_becomes_internal_error() {
        let (tx, rx) = mpsc::channel();
        let on_error: OnError = Box::new(move |err| tx.send(err).unwrap());
        let status =
            begin_async::<(), _>(AmbientContext::empty(), Some(on_error), || {
                panic!("body blew up")
            });
        match status {
            BeginStatus::Failed(err) => assert_eq!(err.kind(), ErrorKind::Internal),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap().kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn on_error_called_exactly_once_for_sync_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let on_error: OnError = Box::new(move |_err| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let _ = begin_async::<i32, _>(AmbientContext::empty(), Some(on_error), || {
            Err(Error::adapter("once"))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
