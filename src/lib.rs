//! Cordon: cancel scopes, ambient context, and direct-style suspension for
//! cooperative asynchronous work.
//!
//! # Overview
//!
//! Cordon is a structured-concurrency core built on three cooperating pieces:
//!
//! - [`begin_async`] and [`suspend_async`], a pair of direct-style primitives
//!   that turn callback APIs into straight-line code. `begin_async` runs a
//!   body on a worker and returns as soon as the body completes or first
//!   suspends; `suspend_async` parks the body until a callback delivers a
//!   value or an error.
//! - [`CancelScope`], a thread-safe registry of cancellable handles with a
//!   re-armable timeout and subscope nesting. Cancelling a scope fans out to
//!   every registered [`Cancellable`] and wakes the suspensions that were
//!   waiting on them.
//! - [`AmbientContext`], a typed bag of values inherited and merged across
//!   nested `begin_async` calls. Code deep inside a suspension callback can
//!   recover the enclosing cancel scope, a work queue, or any user-provided
//!   context object with [`get_context`], without threading parameters
//!   through every layer.
//!
//! # Execution model
//!
//! This crate uses a blocking handoff: `begin_async` parks the calling
//! worker until the body's first suspension, and `suspend_async` parks the
//! body's worker until resumption. Callbacks may deliver `resume`/`fail`
//! from any thread. The contract is deliberately silent on the parking
//! mechanism, so a green-thread or coroutine implementation can replace it
//! without changing what body code observes.
//!
//! # Cancellation guarantees
//!
//! - Cancellation is cooperative, broadcast, and idempotent. A scope cancels
//!   its items in insertion order, outside its own lock.
//! - An item added to an already-cancelled scope is cancelled synchronously,
//!   before `add` returns.
//! - A real result always beats a concurrent cancellation: if an operation
//!   delivers a value or a genuine error after `Cancelled` was recorded, the
//!   real outcome wins.
//! - Subscope cancellation never propagates upward; parent cancellation
//!   reaches every subscope transitively.
//!
//! # Module structure
//!
//! - [`error`]: the error type and its [`Cancelled`](ErrorKind::Cancelled) kind
//! - [`context`]: the typed ambient bag and its merge rule
//! - [`cancel`]: the [`Cancellable`] capability and [`CancelScope`]
//! - [`runtime`]: `begin_async`, `suspend_async`, the worker pool
//! - [`time`]: the single-shot timer driver behind scope timeouts
//! - [`queue`]: the delayed-work adapter discovered through the context
//! - [`future`]: the [`Promise`] combinator built on the public surface

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod cancel;
pub mod context;
pub mod error;
pub mod future;
pub mod queue;
pub mod runtime;
pub mod time;
pub mod tracing_compat;

pub use cancel::{CancelScope, Cancellable};
pub use context::{get_context, AmbientContext};
pub use error::{Error, ErrorKind, Result};
pub use future::Promise;
pub use queue::{DelayedItem, QueueError, WorkQueue};
pub use runtime::{
    begin_async, configure_workers, suspend_async, suspend_async_unscoped, BeginStatus,
    CoroutineState, Fail, OnError, Resume, WorkerPoolOptions,
};
pub use time::{TimerDriver, TimerKey};
