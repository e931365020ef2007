//! End-to-end suspension flows: delayed work, context plumbing across
//! thread hops, the promise combinator, and fatal misuse.

mod common;

use cordon::{
    begin_async, get_context, suspend_async, suspend_async_unscoped, AmbientContext,
    CancelScope, Error, OnError, Promise, WorkQueue,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// A delayed work item resumes the suspension with its value; the scope
/// ends up with no residual registrations and no error is delivered.
#[test]
fn delayed_item_delivers_value() {
    common::init_test_logging();
    let scope = CancelScope::new();
    let queue = WorkQueue::new();
    let errors = Arc::new(AtomicUsize::new(0));
    let errors_clone = Arc::clone(&errors);
    let on_error: OnError = Box::new(move |_err| {
        errors_clone.fetch_add(1, Ordering::SeqCst);
    });

    let (value_tx, value_rx) = mpsc::channel();
    let status = begin_async::<(), _>(
        AmbientContext::value(scope.clone()).with(queue.clone()),
        Some(on_error),
        move || {
            let value: i32 = suspend_async(|resume, _fail| {
                let queue = WorkQueue::ambient().expect("queue in context");
                let scope = get_context::<CancelScope>().expect("scope in context");
                let item = queue
                    .schedule_after(Duration::from_millis(100), move || {
                        resume.resume(42);
                    })
                    .expect("queue open");
                scope.add(item);
            })?;
            value_tx.send(value).unwrap();
            Ok(())
        },
    );
    assert!(status.is_suspended());
    let value = value_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(value, 42);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    wait_until("scope pruning", || scope.item_count() == 0);
    assert_eq!(queue.outstanding(), 0);
}

/// The delayed action runs on a foreign worker but still sees the
/// scheduling body's context, because the queue restores the captured
/// coroutine state around it.
#[test]
fn delayed_action_sees_ambient_context() {
    common::init_test_logging();
    struct Tenant(&'static str);

    let queue = WorkQueue::new();
    let (seen_tx, seen_rx) = mpsc::channel();
    let status = begin_async::<(), _>(
        AmbientContext::value(Tenant("acme")).with(queue.clone()),
        None,
        move || {
            suspend_async_unscoped(|resume| {
                let queue = WorkQueue::ambient().expect("queue in context");
                queue
                    .schedule_after(Duration::from_millis(20), move || {
                        let tenant = get_context::<Tenant>().map(|t| t.0);
                        seen_tx.send(tenant).unwrap();
                        resume.resume(());
                    })
                    .expect("queue open");
            });
            Ok(())
        },
    );
    assert!(status.is_suspended());
    let seen = seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(seen, Some("acme"));
}

/// Three levels of nesting: each level's context shadows the one above
/// for the types it provides and inherits the rest.
#[test]
fn context_inheritance_three_levels_deep() {
    common::init_test_logging();
    struct Level(u8);
    struct Root(&'static str);

    let (tx, rx) = mpsc::channel();
    let status = begin_async::<(), _>(
        AmbientContext::value(Level(1)).with(Root("anchor")),
        None,
        move || {
            let _ = begin_async::<(), _>(AmbientContext::value(Level(2)), None, move || {
                let _ = begin_async::<(), _>(AmbientContext::value(Level(3)), None, move || {
                    let level = get_context::<Level>().unwrap().0;
                    let root = get_context::<Root>().unwrap().0;
                    tx.send((level, root)).unwrap();
                    Ok(())
                });
                Ok(())
            });
            Ok(())
        },
    );
    assert!(status.completed().is_some());
    let (level, root) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(level, 3);
    assert_eq!(root, "anchor");
}

/// A promise begun over the queue resolves its awaiter in another body.
#[test]
fn promise_resolves_awaiter_across_bodies() {
    common::init_test_logging();
    let queue = WorkQueue::new();
    let promise = Promise::begin(AmbientContext::value(queue.clone()), || {
        let value: i32 = suspend_async_unscoped(|resume| {
            let queue = WorkQueue::ambient().expect("queue in context");
            queue
                .schedule_after(Duration::from_millis(50), move || resume.resume(21))
                .expect("queue open");
        });
        Ok(value * 2)
    });
    assert!(!promise.is_resolved());

    let (tx, rx) = mpsc::channel();
    let awaited = promise.clone();
    let status = begin_async::<(), _>(AmbientContext::empty(), None, move || {
        tx.send(awaited.await_value()).unwrap();
        Ok(())
    });
    assert!(status.is_suspended());
    let value = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(value, 42);
    // A second await returns the cached value without suspending.
    assert_eq!(promise.await_value().unwrap(), 42);
}

/// A promise whose body fails resolves every awaiter with the error.
#[test]
fn promise_propagates_failure() {
    common::init_test_logging();
    let promise: Promise<i32> = Promise::begin(AmbientContext::empty(), || {
        suspend_async_unscoped(|resume| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                resume.resume(());
            });
        });
        Err(Error::adapter("upstream went away"))
    });

    let (tx, rx) = mpsc::channel();
    let awaited = promise.clone();
    let _ = begin_async::<(), _>(AmbientContext::empty(), None, move || {
        tx.send(awaited.await_value()).unwrap();
        Ok(())
    });
    let err = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
    assert!(!err.is_cancelled());
    wait_until("promise resolution", || promise.is_resolved());
}

/// A resumption that loses the race against cancellation is dropped
/// without panicking; the awaiter keeps the cancellation outcome.
#[test]
fn late_resume_after_cancellation_is_tolerated() {
    common::init_test_logging();
    let scope = CancelScope::new();
    let (resume_tx, resume_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();

    struct InertItem;
    impl cordon::Cancellable for InertItem {
        fn cancel(&self) {}
        fn is_cancelled(&self) -> bool {
            true
        }
        fn into_any(
            self: Arc<Self>,
        ) -> Arc<dyn std::any::Any + Send + Sync> {
            self
        }
    }

    let status = begin_async::<(), _>(AmbientContext::value(scope.clone()), None, move || {
        let result: cordon::Result<i32> = suspend_async(|resume, _fail| {
            let scope = get_context::<CancelScope>().expect("scope in context");
            scope.add(Arc::new(InertItem));
            resume_tx.send(resume).unwrap();
        });
        result_tx.send(result).unwrap();
        Ok(())
    });
    assert!(status.is_suspended());
    let resume = resume_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    scope.cancel();
    let result = result_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(result.unwrap_err().is_cancelled());
    // The operation delivers its value anyway; nothing blows up and the
    // already-returned cancellation stands.
    resume.resume(7);
}

/// The unscoped variant never consults the scope: cancelling has no
/// effect on it and the callback's value arrives untouched.
#[test]
fn unscoped_suspension_ignores_cancellation() {
    common::init_test_logging();
    let scope = CancelScope::new();
    let (value_tx, value_rx) = mpsc::channel();
    let status = begin_async::<(), _>(AmbientContext::value(scope.clone()), None, move || {
        let value = suspend_async_unscoped(|resume| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                resume.resume("untouched");
            });
        });
        value_tx.send(value).unwrap();
        Ok(())
    });
    assert!(status.is_suspended());
    scope.cancel();
    let value = value_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(value, "untouched");
}

#[test]
#[should_panic(expected = "already-resumed")]
fn double_resume_is_fatal() {
    common::init_test_logging();
    let (tx, rx) = mpsc::channel();
    let _ = begin_async::<(), _>(AmbientContext::empty(), None, move || {
        suspend_async_unscoped::<i32, _>(|resume| {
            tx.send(resume).unwrap();
        });
        Ok(())
    });
    let resume = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    resume.resume(1);
    resume.resume(2);
}

#[test]
#[should_panic(expected = "requires an enclosing begin_async")]
fn suspend_outside_body_is_fatal() {
    common::init_test_logging();
    let _ = suspend_async::<(), _>(|_resume, _fail| {});
}

#[test]
#[should_panic(expected = "requires an active suspend_async frame")]
fn add_outside_suspension_is_fatal() {
    common::init_test_logging();

    struct InertItem;
    impl cordon::Cancellable for InertItem {
        fn cancel(&self) {}
        fn is_cancelled(&self) -> bool {
            true
        }
        fn into_any(
            self: Arc<Self>,
        ) -> Arc<dyn std::any::Any + Send + Sync> {
            self
        }
    }

    let scope = CancelScope::new();
    scope.add(Arc::new(InertItem));
}
