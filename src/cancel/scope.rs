//! The cancel scope: a registry of cancellables with broadcast
//! cancellation, a re-armable timeout, and subscope nesting.
//!
//! A scope owns two mutex-guarded structures: the ordered item list and
//! the failure stack. The failure stack holds one closure per active
//! suspension rooted in this scope; `add` binds each new item to the
//! topmost closure, which is how a later `cancel()` reaches the awaiter
//! that is actually parked on that item. Snapshots are taken under the
//! lock and fired outside it, so a cancellable whose `cancel` re-enters
//! the scope cannot deadlock.

use crate::cancel::Cancellable;
use crate::error::Error;
use crate::time::{TimerDriver, TimerKey};
use crate::tracing_compat::{debug, trace};
use std::any::Any;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Failure closure pushed by a suspension; receives cancellation and
/// routes it into the suspension's frame.
pub(crate) type FailureHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Identifies one entry of a scope's failure stack, so the items
/// registered under it can be pruned when the suspension resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameTag(u64);

#[derive(Clone)]
struct ScopeItem {
    cancellable: Arc<dyn Cancellable>,
    handler: FailureHandler,
    tag: FrameTag,
}

struct FrameEntry {
    tag: FrameTag,
    handler: FailureHandler,
}

struct ScopeState {
    items: Vec<ScopeItem>,
    failure_stack: Vec<FrameEntry>,
    cancel_called: bool,
    next_tag: u64,
}

struct ScopeInner {
    state: Mutex<ScopeState>,
    timer: Mutex<Option<TimerKey>>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if let Some(key) = self.timer.lock().unwrap().take() {
            TimerDriver::global().disarm(key);
        }
    }
}

/// A cancellation domain.
///
/// Cancellables registered with [`add`](Self::add) are cancelled, in
/// insertion order, when [`cancel`](Self::cancel) runs, when the armed
/// timeout fires, or when a parent scope cancels (subscopes are
/// registered as cancellables of their parent). The handle is cheap to
/// clone; all clones address the same scope, and the timeout is disarmed
/// when the last clone drops.
#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl CancelScope {
    /// Creates a scope with no timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                state: Mutex::new(ScopeState {
                    items: Vec::new(),
                    failure_stack: Vec::new(),
                    cancel_called: false,
                    next_tag: 0,
                }),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Creates a scope that cancels itself after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let scope = Self::new();
        scope.set_timeout(timeout);
        scope
    }

    /// Cancels every registered item.
    ///
    /// Items are snapshotted under the lock and cancelled outside it, in
    /// insertion order: each item's failure closure fires with a
    /// cancellation error, then the item's own `cancel` runs. Calling
    /// this repeatedly is safe; each call broadcasts to the items
    /// registered at that moment.
    pub fn cancel(&self) {
        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            state.cancel_called = true;
            state.items.clone()
        };
        if let Some(key) = self.inner.timer.lock().unwrap().take() {
            TimerDriver::global().disarm(key);
        }
        debug!(items = snapshot.len(), "cancel scope broadcasting");
        for item in snapshot {
            (item.handler)(Error::cancelled());
            item.cancellable.cancel();
        }
    }

    /// Returns true when every currently registered item reports itself
    /// cancelled. Vacuously true for a scope with no items.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.items.iter().all(|item| item.cancellable.is_cancelled())
    }

    /// Returns true once `cancel` has run (explicitly or via timeout).
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.inner.state.lock().unwrap().cancel_called
    }

    /// Registers a cancellable, bound to the innermost active suspension.
    ///
    /// If the scope was already cancelled, the item's failure closure
    /// fires with a cancellation error and the item is cancelled before
    /// this call returns.
    ///
    /// # Panics
    ///
    /// Panics when no suspension is active on this scope; registering an
    /// item nothing is waiting on is a programmer error.
    pub fn add(&self, cancellable: Arc<dyn Cancellable>) {
        let fire = {
            let mut state = self.inner.state.lock().unwrap();
            let top = state
                .failure_stack
                .last()
                .expect("CancelScope::add requires an active suspend_async frame");
            let handler = Arc::clone(&top.handler);
            let tag = top.tag;
            state.items.push(ScopeItem {
                cancellable: Arc::clone(&cancellable),
                handler: Arc::clone(&handler),
                tag,
            });
            trace!(already_cancelled = state.cancel_called, "item registered");
            state.cancel_called.then_some(handler)
        };
        if let Some(handler) = fire {
            handler(Error::cancelled());
            cancellable.cancel();
        }
    }

    /// Returns the registered items of concrete type `T`, in insertion
    /// order. Lets adapters act on a whole class of items, for example
    /// pausing every in-flight request handle.
    #[must_use]
    pub fn cancellables<T: Cancellable>(&self) -> Vec<Arc<T>> {
        let state = self.inner.state.lock().unwrap();
        state
            .items
            .iter()
            .filter_map(|item| {
                let any: Arc<dyn Any + Send + Sync> =
                    Arc::clone(&item.cancellable).into_any();
                any.downcast::<T>().ok()
            })
            .collect()
    }

    /// Returns the number of currently registered items.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    /// Creates a subscope with no timeout of its own.
    ///
    /// The child routes its cancellations to the awaiter of this scope's
    /// innermost active suspension, and is registered as a cancellable of
    /// this scope: cancelling the parent cancels the child, while
    /// cancelling the child leaves the parent untouched.
    ///
    /// # Panics
    ///
    /// Panics when no suspension is active on this scope.
    #[must_use]
    pub fn make_subscope(&self) -> CancelScope {
        self.make_subscope_inner(None)
    }

    /// Creates a subscope that cancels itself after `timeout`.
    ///
    /// # Panics
    ///
    /// Panics when no suspension is active on this scope.
    #[must_use]
    pub fn make_subscope_with_timeout(&self, timeout: Duration) -> CancelScope {
        self.make_subscope_inner(Some(timeout))
    }

    fn make_subscope_inner(&self, timeout: Option<Duration>) -> CancelScope {
        let parent_handler = {
            let state = self.inner.state.lock().unwrap();
            let top = state
                .failure_stack
                .last()
                .expect("make_subscope requires an active suspend_async frame");
            Arc::clone(&top.handler)
        };
        let child = CancelScope::new();
        // The child's root frame never pops: anything registered directly
        // on the child reaches the parent's awaiter through it.
        child.push_failure_handler(parent_handler);
        if let Some(timeout) = timeout {
            child.set_timeout(timeout);
        }
        self.add(Arc::new(child.clone()));
        child
    }

    /// Arms, or re-arms, the timeout.
    ///
    /// Any previously armed timer is disarmed first; the new deadline is
    /// `timeout` from now. A zero duration only disarms.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut armed = self.inner.timer.lock().unwrap();
        if let Some(key) = armed.take() {
            TimerDriver::global().disarm(key);
        }
        if timeout.is_zero() {
            return;
        }
        let weak: Weak<ScopeInner> = Arc::downgrade(&self.inner);
        let key = TimerDriver::global().schedule(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                debug!("scope timeout elapsed");
                CancelScope { inner }.cancel();
            }
        });
        *armed = Some(key);
    }

    /// Disarms the timeout, if armed.
    pub fn clear_timeout(&self) {
        if let Some(key) = self.inner.timer.lock().unwrap().take() {
            TimerDriver::global().disarm(key);
        }
    }

    /// Pushes a suspension's failure closure, returning the tag that
    /// identifies items registered while it is topmost.
    pub(crate) fn push_failure_handler(&self, handler: FailureHandler) -> FrameTag {
        let mut state = self.inner.state.lock().unwrap();
        let tag = FrameTag(state.next_tag);
        state.next_tag += 1;
        state.failure_stack.push(FrameEntry { tag, handler });
        tag
    }

    /// Resolves a suspension: pops its failure closure and prunes the
    /// items registered under it. Items registered under outer frames
    /// survive.
    pub(crate) fn resolve_frame(&self, tag: FrameTag) {
        let mut state = self.inner.state.lock().unwrap();
        let popped = state.failure_stack.pop();
        debug_assert!(
            popped.map_or(false, |entry| entry.tag == tag),
            "suspension frames resolved out of order"
        );
        state.items.retain(|item| item.tag != tag);
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("CancelScope")
            .field("items", &state.items.len())
            .field("cancel_called", &state.cancel_called)
            .field("active_frames", &state.failure_stack.len())
            .finish()
    }
}

impl Cancellable for CancelScope {
    fn cancel(&self) {
        CancelScope::cancel(self);
    }

    fn is_cancelled(&self) -> bool {
        CancelScope::is_cancelled(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
