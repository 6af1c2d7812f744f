//! Task-local execution context: cancellation identities, delivery state,
//! and the per-task deadline stack.
//!
//! Cancellation is a value, not an unwind: requesting cancellation delivers
//! a [`CancelId`] into the target task's pending slot and bumps its
//! outstanding-request counter. The innermost active delivery point (a
//! `run` combinator or [`checkpoint`]) consumes the slot and converts it to
//! [`Error::Cancelled`], which then travels outward through ordinary `?`
//! propagation until the scope that requested it recognizes itself.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Poll, Waker};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::errors::Error;
use crate::scope::ScopeState;

/// Identity of a cancellable entity: a scope, a group, or a task.
///
/// Every delivered cancellation carries the requester's id so that nested
/// scopes can attribute a cancellation to the one that asked for it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelId(Uuid);

impl CancelId {
    /// Creates a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short hex form used in diagnostic labels.
    pub(crate) fn short(self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl Default for CancelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CancelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CancelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancelId({})", self.short())
    }
}

/// Cancellation delivery state for one logical task.
#[derive(Default)]
struct CancelState {
    /// Outstanding cancellation requests delivered to this task.
    requested: u32,
    /// A delivered-but-unconsumed cancellation (first delivery wins).
    pending: Option<CancelId>,
    /// Wakes the task when a cancellation arrives.
    waker: Option<Waker>,
}

/// One logical task as the cancellation machinery sees it.
///
/// Shared between the task itself, the scopes entered on it, and any group
/// that spawned it.
pub(crate) struct TaskContext {
    id: CancelId,
    label: String,
    cancel: Mutex<CancelState>,
}

impl TaskContext {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self::with_id(CancelId::new(), label)
    }

    /// Builds a task around a pre-allocated id, for callers that derive the
    /// label from the id itself.
    pub(crate) fn with_id(id: CancelId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            cancel: Mutex::new(CancelState::default()),
        }
    }

    pub(crate) fn id(&self) -> CancelId {
        self.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Delivers a cancellation to this task.
    ///
    /// Bumps the outstanding counter; the pending slot keeps the first
    /// unconsumed requester.
    pub(crate) fn deliver(&self, origin: CancelId) {
        let mut state = self.cancel.lock();
        state.requested += 1;
        if state.pending.is_none() {
            state.pending = Some(origin);
        }
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Consumes the pending delivery, if any.
    pub(crate) fn take_pending(&self) -> Option<CancelId> {
        self.cancel.lock().pending.take()
    }

    /// Current outstanding-request count.
    pub(crate) fn outstanding(&self) -> u32 {
        self.cancel.lock().requested
    }

    /// Withdraws one request made by `origin`: decrements the counter and
    /// clears the pending slot when it still holds `origin` unconsumed.
    /// Returns the remaining count.
    pub(crate) fn retract(&self, origin: CancelId) -> u32 {
        let mut state = self.cancel.lock();
        state.requested = state.requested.saturating_sub(1);
        if state.pending == Some(origin) {
            state.pending = None;
        }
        state.requested
    }

    /// Resolves with the requester's id once a cancellation is pending.
    pub(crate) fn cancelled_signal(&self) -> impl Future<Output = CancelId> + '_ {
        std::future::poll_fn(move |cx| {
            let mut state = self.cancel.lock();
            if let Some(origin) = state.pending.take() {
                Poll::Ready(origin)
            } else {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        })
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.cancel.lock();
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("requested", &state.requested)
            .field("pending", &state.pending)
            .finish()
    }
}

/// Value held in the task-local: the current logical task plus its deadline
/// stack. The stack is copied by value into children at spawn time, so
/// siblings never observe each other's scopes.
pub(crate) struct TaskCtx {
    task: Arc<TaskContext>,
    stack: RefCell<Vec<Arc<ScopeState>>>,
}

impl TaskCtx {
    pub(crate) fn new(task: Arc<TaskContext>, stack: Vec<Arc<ScopeState>>) -> Self {
        Self {
            task,
            stack: RefCell::new(stack),
        }
    }

    fn root() -> Self {
        Self::new(Arc::new(TaskContext::new("main")), Vec::new())
    }
}

tokio::task_local! {
    static CONTEXT: TaskCtx;
}

/// The current logical task, if a context is active.
pub(crate) fn current_task() -> Option<Arc<TaskContext>> {
    CONTEXT.try_with(|ctx| Arc::clone(&ctx.task)).ok()
}

/// Snapshot of the caller's deadline stack, empty when no context is active.
pub(crate) fn snapshot_stack() -> Vec<Arc<ScopeState>> {
    CONTEXT
        .try_with(|ctx| ctx.stack.borrow().clone())
        .unwrap_or_default()
}

pub(crate) fn push_scope(scope: Arc<ScopeState>) {
    let _ = CONTEXT.try_with(|ctx| ctx.stack.borrow_mut().push(scope));
}

/// Removes `scope` from the caller's stack. Entered scopes exit LIFO, so
/// this is normally the last entry; removal is by identity to stay correct
/// when exits interleave unusually.
pub(crate) fn pop_scope(scope: &Arc<ScopeState>) {
    let _ = CONTEXT.try_with(|ctx| {
        let mut stack = ctx.stack.borrow_mut();
        if let Some(idx) = stack.iter().rposition(|s| Arc::ptr_eq(s, scope)) {
            stack.remove(idx);
        }
    });
}

/// Runs `f` against the caller's deadline stack.
pub(crate) fn with_stack<R>(f: impl FnOnce(&[Arc<ScopeState>]) -> R) -> Option<R> {
    CONTEXT.try_with(|ctx| f(&ctx.stack.borrow())).ok()
}

/// Ensures a task context exists around `fut`: reuses the caller's when
/// present, otherwise installs a fresh root. Public combinators go through
/// this so they work directly under `#[tokio::main]`.
pub(crate) async fn in_context<F>(fut: F) -> F::Output
where
    F: Future,
{
    if CONTEXT.try_with(|_| ()).is_ok() {
        fut.await
    } else {
        CONTEXT.scope(TaskCtx::root(), fut).await
    }
}

/// Installs a child context (fresh task, snapshotted stack) around a
/// spawned future.
pub(crate) fn scoped<F>(
    task: Arc<TaskContext>,
    stack: Vec<Arc<ScopeState>>,
    fut: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    CONTEXT.scope(TaskCtx::new(task, stack), fut)
}

/// Drives `fut` as a delivery point for `task`.
///
/// The body is polled first, the cancellation signal second, so a pending
/// cancellation is consumed by the innermost active delivery point and a
/// ready body wins over a simultaneous delivery.
pub(crate) async fn cancellable<F>(task: &TaskContext, fut: F) -> Result<F::Output, CancelId>
where
    F: Future,
{
    tokio::pin!(fut);
    tokio::select! {
        biased;
        out = &mut fut => Ok(out),
        origin = task.cancelled_signal() => Err(origin),
    }
}

/// An explicit delivery point: yields to the scheduler and surfaces a
/// pending cancellation as [`Error::Cancelled`].
///
/// Useful in compute-heavy stretches with no natural awaits. Outside any
/// task context this is a plain yield.
pub async fn checkpoint() -> Result<(), Error> {
    let task = current_task();
    if let Some(task) = &task {
        if let Some(origin) = task.take_pending() {
            return Err(Error::Cancelled(origin));
        }
    }
    tokio::task::yield_now().await;
    if let Some(task) = &task {
        if let Some(origin) = task.take_pending() {
            return Err(Error::Cancelled(origin));
        }
    }
    Ok(())
}
