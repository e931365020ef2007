//! Cancellation as a capability.
//!
//! Anything that can be asked to stop implements [`Cancellable`]: an
//! in-flight request handle, a delayed work item, or a whole
//! [`CancelScope`] (scopes are themselves cancellable, which is what makes
//! subscope nesting work). A scope owns a set of cancellables and fans a
//! single `cancel()` call out to all of them.

mod scope;

pub use scope::CancelScope;
pub(crate) use scope::FrameTag;

use std::any::Any;
use std::sync::Arc;

/// A handle to work that can be asked to stop.
///
/// `cancel` requests cessation of the underlying work. It must be safe to
/// call from any thread and safe to call more than once; implementations
/// treat repeated calls as no-ops. `is_cancelled` reflects observable
/// state, which for some adapters includes a platform-reported terminal
/// cancellation in addition to a locally requested one.
///
/// `suspend` and `resume` default to no-ops. Adapters whose underlying
/// work supports pausing (an HTTP task, for example) override them; a
/// scope can then pause a whole class of items via
/// [`CancelScope::cancellables`].
pub trait Cancellable: Send + Sync + 'static {
    /// Requests that the underlying work stop. Idempotent.
    fn cancel(&self);

    /// Returns true once this handle observes itself as cancelled.
    fn is_cancelled(&self) -> bool;

    /// Pauses the underlying work, when supported.
    fn suspend(&self) {}

    /// Resumes previously paused work, when supported.
    fn resume(&self) {}

    /// Upcasts for typed enumeration. Implementations return `self`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
