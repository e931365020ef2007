//! The typed ambient context carried through nested asynchronous bodies.
//!
//! An [`AmbientContext`] is an ordered collection of values of arbitrary
//! types, looked up by type. It is not a global: each `begin_async` body
//! runs under an explicitly installed context, and nesting merges the new
//! context in front of the inherited one so that inner values shadow outer
//! values while outer values stay discoverable.
//!
//! The context is conceptually immutable. Constructors and [`with`]
//! produce new contexts; a context installed for a body never changes
//! underneath it.
//!
//! [`with`]: AmbientContext::with

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// One element of a context: a shared value of some concrete type.
type ContextValue = Arc<dyn Any + Send + Sync>;

/// An ordered, typed bag of ambient values.
///
/// Lookup with [`get`](Self::get) scans elements front to back and returns
/// the first whose concrete type matches. Merging for nested bodies places
/// the inner context's elements in front of the outer context's, so the
/// innermost provider of a type wins.
///
/// Cloning is cheap; the element list is shared.
#[derive(Clone)]
pub struct AmbientContext {
    values: Arc<Vec<ContextValue>>,
}

impl AmbientContext {
    /// Creates an empty context.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            values: Arc::new(Vec::new()),
        }
    }

    /// Creates a context holding a single value.
    #[must_use]
    pub fn value<T: Send + Sync + 'static>(value: T) -> Self {
        Self::shared(Arc::new(value))
    }

    /// Creates a context holding a single already-shared value.
    ///
    /// The same `Arc` is returned by later [`get`](Self::get) calls, which
    /// matters for handle types whose identity is observable.
    #[must_use]
    pub fn shared<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            values: Arc::new(vec![value as ContextValue]),
        }
    }

    /// Returns a context with `value` added in front of the existing
    /// elements, so it shadows any element of the same type.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(&self, value: T) -> Self {
        let mut values: Vec<ContextValue> = Vec::with_capacity(self.values.len() + 1);
        values.push(Arc::new(value) as ContextValue);
        values.extend(self.values.iter().cloned());
        Self {
            values: Arc::new(values),
        }
    }

    /// Looks up the first element of type `T`, front to back.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.values
            .iter()
            .find_map(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// Returns true when the context holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Merges a new (inner) context with an inherited (outer) one.
    ///
    /// Either side being empty yields the other. A context merged with
    /// itself yields itself. Otherwise the merged context holds the inner
    /// elements followed by the outer elements, which is what makes inner
    /// values shadow outer values at lookup while leaving outer values
    /// reachable for types the inner context does not provide.
    #[must_use]
    pub fn merge(inner: &Self, outer: &Self) -> Self {
        if inner.is_empty() {
            return outer.clone();
        }
        if outer.is_empty() {
            return inner.clone();
        }
        if Arc::ptr_eq(&inner.values, &outer.values) {
            return outer.clone();
        }
        let mut values: Vec<ContextValue> = Vec::with_capacity(inner.len() + outer.len());
        values.extend(inner.values.iter().cloned());
        values.extend(outer.values.iter().cloned());
        Self {
            values: Arc::new(values),
        }
    }
}

impl Default for AmbientContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for AmbientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientContext")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Looks up a value of type `T` in the context of the currently executing
/// asynchronous body.
///
/// Returns `None` when no body is executing on this thread or when the
/// installed context holds no element of type `T`.
#[must_use]
pub fn get_context<T: Send + Sync + 'static>() -> Option<Arc<T>> {
    crate::runtime::current_context().get::<T>()
}
