//! Error types for cordon operations.
//!
//! Errors here are values that flow through suspensions: a cancelled scope
//! delivers [`ErrorKind::Cancelled`] to every awaiter, an adapter surfaces
//! its own failure through [`ErrorKind::Adapter`], and so on. Programmer
//! errors (suspending outside `begin_async`, resuming a resolved frame) are
//! not represented here; those panic at the misuse site.
//!
//! Errors are `Clone` because a single failure may be delivered twice: once
//! to the `on_error` handler of `begin_async` and once to the caller that
//! observed the synchronous completion.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled, either explicitly or by a scope timeout.
    Cancelled,
    /// The work queue has been closed and accepts no further items.
    QueueClosed,
    /// An adapter's underlying work failed (network error, rejected item).
    Adapter,
    /// Internal invariant violation surfaced as an error (body panic).
    Internal,
}

impl ErrorKind {
    /// Returns a short static description of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::QueueClosed => "queue closed",
            Self::Adapter => "adapter error",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type delivered through suspensions and `on_error` handlers.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Creates an adapter error with a descriptive message.
    #[must_use]
    pub fn adapter(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Adapter).with_context(context)
    }

    /// Creates an internal error with a descriptive message.
    #[must_use]
    pub(crate) fn internal(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_context(context)
    }

    /// Attaches a human-readable context string.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches an underlying source error.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the attached context string, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{}: {context}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result alias for cordon operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;
