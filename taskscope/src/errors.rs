//! Error types for taskscope primitives.
//!
//! Cancellation travels through return values rather than unwinding, so the
//! whole taxonomy is cloneable: a single child failure can surface both
//! through its [`ChildHandle`](crate::group::ChildHandle) and inside the
//! owning group's aggregate.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::context::CancelId;

/// The main error type for taskscope operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A cooperative cancellation unwinding the current task, tagged with
    /// the identity of the scope, group, or handle that requested it.
    #[error("cancelled (requested by {0})")]
    Cancelled(CancelId),

    /// A `fail_*` scope's own deadline elapsed.
    #[error("deadline exceeded")]
    Timeout,

    /// One or more children of a task group failed.
    #[error("{0}")]
    Aggregate(#[from] AggregateError),

    /// A spawned task panicked. The owning group re-raises the panic after
    /// draining; this variant is what the child's handle reports.
    #[error("task '{task}' panicked")]
    Panicked {
        /// Diagnostic label of the task that panicked.
        task: String,
    },

    /// Structural misuse of a scope or group, reported at the call site.
    #[error("{0}")]
    Usage(#[from] UsageError),

    /// An application-level failure carried through a group.
    #[error("{0}")]
    App(Arc<anyhow::Error>),
}

impl Error {
    /// Wraps an application error.
    #[must_use]
    pub fn app(err: impl Into<anyhow::Error>) -> Self {
        Self::App(Arc::new(err.into()))
    }

    /// Creates an application error from a message.
    #[must_use]
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::App(Arc::new(anyhow::Error::msg(msg.into())))
    }

    /// Returns whether this is a cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns whether this is a converted timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns the identity that requested the cancellation, if this is one.
    #[must_use]
    pub fn cancel_origin(&self) -> Option<CancelId> {
        match self {
            Self::Cancelled(origin) => Some(*origin),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::App(Arc::new(err))
    }
}

/// Error raised synchronously on structural misuse of the primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsageError {
    /// A cancel scope was entered more than once.
    #[error("cancel scope entered more than once")]
    ScopeAlreadyEntered,

    /// A cancel scope was exited without being entered.
    #[error("cancel scope exited without being entered")]
    ScopeNotEntered,

    /// A task group was entered more than once.
    #[error("task group entered more than once")]
    GroupAlreadyEntered,

    /// A task was spawned into a group that is not open, or a group was
    /// exited while not open.
    #[error("task group is not open")]
    GroupNotOpen,

    /// The calling task has no task context; the operation only makes sense
    /// inside `run`-style combinators or a spawned child.
    #[error("no task context is active on the current task")]
    NoTaskContext,
}

/// An ordered collection of child failures raised as a single failure.
///
/// Aggregates keep completion order, not spawn order, and may nest: an
/// inner group's aggregate appears as one member of the outer one, never
/// flattened.
#[derive(Debug, Clone)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    /// Creates an aggregate from collected failures.
    #[must_use]
    pub fn new(errors: Vec<Error>) -> Self {
        debug_assert!(!errors.is_empty(), "aggregate built from no failures");
        Self { errors }
    }

    /// The collected failures, in completion order.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Consumes the aggregate, yielding the collected failures.
    #[must_use]
    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }

    /// Number of collected failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns whether the aggregate is empty. Groups never raise an empty
    /// aggregate; this exists for symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            write!(f, "1 unhandled error in a task group")
        } else {
            write!(f, "{} unhandled errors in a task group", self.errors.len())
        }
    }
}

impl std::error::Error for AggregateError {}
