//! Task groups: structured spawning with guaranteed drain and failure
//! aggregation.
//!
//! A [`TaskGroup`] owns every child spawned during its open window. Leaving
//! the group's block drains all of them: completed, cancelled, or failed, no
//! child outlives the group. Failures are collected in completion order and
//! surface as a single [`AggregateError`]; a failing child cancels its
//! siblings and the group body.

mod background;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use self::background::BackgroundState;
use crate::context::{self, CancelId, TaskContext};
use crate::errors::{AggregateError, Error, UsageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Created,
    Open,
    Draining,
    Closed,
}

/// Bookkeeping for one spawned child, kept until its completion observer
/// runs.
struct ChildRecord {
    label: String,
    ctx: Arc<TaskContext>,
    background: bool,
    bg: BackgroundState,
}

/// Shared state behind every clone of a [`TaskGroup`] and the futures it
/// spawns.
struct GroupCore {
    /// Identity used as the origin of every cancellation this group requests.
    id: CancelId,
    name: String,
    state: Mutex<GroupState>,
    parent: Mutex<Option<Arc<TaskContext>>>,
    children: Mutex<HashMap<CancelId, ChildRecord>>,
    pending: AtomicUsize,
    drained: Notify,
    /// Non-cancellation child failures, in completion order.
    errors: Mutex<Vec<Error>>,
    /// First panic payload from the body or a child; resumed alone on exit.
    fatal: Mutex<Option<Box<dyn Any + Send>>>,
    abort_requested: AtomicBool,
    /// True once the group has cancelled its own body, so exit can tell a
    /// self-requested cancellation from an external one.
    parent_cancel_requested: AtomicBool,
    /// Set when the exit sequence starts; abort no longer cancels the body.
    exiting: AtomicBool,
    /// Set once exit (or abandonment) finished; late child errors go to the
    /// log instead.
    finished: AtomicBool,
}

impl GroupCore {
    fn new(id: CancelId, name: String) -> Self {
        Self {
            id,
            name,
            state: Mutex::new(GroupState::Created),
            parent: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
            errors: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            abort_requested: AtomicBool::new(false),
            parent_cancel_requested: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Cancels every unfinished child and, unless exit has already begun,
    /// the group body itself. The body is only cancelled when no other
    /// cancellation is outstanding on it, and at most once; that request is
    /// recorded as self-requested.
    fn abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        let victims: Vec<Arc<TaskContext>> = {
            let children = self.children.lock();
            children.values().map(|c| Arc::clone(&c.ctx)).collect()
        };
        if !victims.is_empty() {
            tracing::debug!(group = %self.name, children = victims.len(), "cancelling children");
        }
        for ctx in victims {
            ctx.deliver(self.id);
        }

        if !self.exiting.load(Ordering::SeqCst) {
            let parent = self.parent.lock().clone();
            if let Some(parent) = parent {
                if parent.outstanding() == 0
                    && !self.parent_cancel_requested.swap(true, Ordering::SeqCst)
                {
                    parent.deliver(self.id);
                }
            }
        }
    }

    fn record_fatal(&self, payload: Box<dyn Any + Send>) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(payload);
        }
    }

    /// Completion observer, run by every child wrapper exactly once.
    fn on_child_done(&self, id: CancelId, err: Option<&Error>) {
        let label = self
            .children
            .lock()
            .remove(&id)
            .map(|record| record.label)
            .unwrap_or_default();
        match err {
            None | Some(Error::Cancelled(_)) => {}
            Some(err) => {
                if self.finished.load(Ordering::SeqCst) {
                    // Nothing left to raise into, panics included.
                    tracing::error!(
                        group = %self.name,
                        child = %label,
                        error = %err,
                        "child failed after its group finished"
                    );
                } else if matches!(err, Error::Panicked { .. }) {
                    // The payload is already recorded as fatal.
                    self.abort();
                } else {
                    self.errors.lock().push(err.clone());
                    self.abort();
                }
            }
        }
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once no child is pending. Interest is registered before the
    /// count is checked so a completion between the two cannot be missed.
    async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.finished.store(true, Ordering::SeqCst);
        *self.state.lock() = GroupState::Closed;
    }
}

/// Cancels the children of a group whose future was dropped mid-flight.
///
/// Dropping a group's `run` future (for example from a lost `select!`
/// branch) skips the drain. The guard turns that into a best-effort
/// cooperative shutdown instead of a task leak. A panic resumed by `exit`
/// unwinds past the disarm, so the guard also stands down once the group
/// has closed.
struct AbandonGuard {
    core: Arc<GroupCore>,
    armed: bool,
}

impl AbandonGuard {
    fn new(core: Arc<GroupCore>) -> Self {
        Self { core, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed || self.core.finished.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!(
            group = %self.core.name,
            pending = self.core.pending.load(Ordering::SeqCst),
            "task group dropped before draining; cancelling children"
        );
        self.core.exiting.store(true, Ordering::SeqCst);
        self.core.close();
        self.core.abort();
    }
}

/// A nursery for concurrent child tasks.
///
/// Children are spawned while the group is open and are all drained before
/// [`run`](Self::run) returns, on every path. One child's failure cancels
/// the siblings and the body; the failures that remain are raised together
/// as an [`AggregateError`] in completion order.
///
/// ```no_run
/// use taskscope::{Error, TaskGroup};
///
/// # async fn demo() -> Result<(), Error> {
/// let group = TaskGroup::new();
/// let total = group
///     .run(|g| async move {
///         let a = g.spawn(async { Ok(2) })?;
///         let b = g.spawn(async { Ok(3) })?;
///         Ok(a.join().await? + b.join().await?)
///     })
///     .await?;
/// assert_eq!(total, 5);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskGroup {
    core: Arc<GroupCore>,
}

impl TaskGroup {
    /// Creates a group with a generated name.
    #[must_use]
    pub fn new() -> Self {
        let id = CancelId::new();
        let name = format!("group-{}", id.short());
        Self {
            core: Arc::new(GroupCore::new(id, name)),
        }
    }

    /// Creates a group with the given name, used in logs and child labels.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            core: Arc::new(GroupCore::new(CancelId::new(), name.into())),
        }
    }

    /// The group's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Number of children spawned but not yet finished.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.core.pending.load(Ordering::SeqCst)
    }

    /// Opens the group on the current task.
    ///
    /// Fails with [`UsageError::GroupAlreadyEntered`] on a second entry and
    /// with [`UsageError::NoTaskContext`] outside a task context. Most
    /// callers want [`run`](Self::run), which pairs entry and exit.
    pub fn enter(&self) -> Result<(), Error> {
        let Some(task) = context::current_task() else {
            return Err(UsageError::NoTaskContext.into());
        };
        let mut state = self.core.state.lock();
        if *state != GroupState::Created {
            return Err(UsageError::GroupAlreadyEntered.into());
        }
        *state = GroupState::Open;
        *self.core.parent.lock() = Some(task);
        Ok(())
    }

    /// Spawns a child running `unit`.
    ///
    /// The child starts with a snapshot of the caller's scope stack, so
    /// deadlines in force here apply to it, and siblings never observe each
    /// other's scopes. Fails with [`UsageError::GroupNotOpen`] unless the
    /// group is open. Dropping the returned handle detaches it; the group
    /// still drains the child.
    pub fn spawn<T, F>(&self, unit: F) -> Result<ChildHandle<T>, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.spawn_inner(None, false, unit)
    }

    /// Spawns a child with an explicit label for logs and panic reports.
    pub fn spawn_named<T, F>(&self, name: impl Into<String>, unit: F) -> Result<ChildHandle<T>, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.spawn_inner(Some(name.into()), false, unit)
    }

    fn spawn_inner<T, F>(
        &self,
        name: Option<String>,
        background: bool,
        unit: F,
    ) -> Result<ChildHandle<T>, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let id = CancelId::new();
        let label = name.unwrap_or_else(|| format!("task-{}", id.short()));
        let child = Arc::new(TaskContext::with_id(id, label.clone()));
        let stack = context::snapshot_stack();

        {
            let state = self.core.state.lock();
            if *state != GroupState::Open {
                return Err(UsageError::GroupNotOpen.into());
            }
            self.core.children.lock().insert(
                id,
                ChildRecord {
                    label: label.clone(),
                    ctx: Arc::clone(&child),
                    background,
                    bg: BackgroundState::Default,
                },
            );
            self.core.pending.fetch_add(1, Ordering::SeqCst);
        }

        let core = Arc::clone(&self.core);
        let task = Arc::clone(&child);
        let wrapper = async move {
            let out = match context::cancellable(&task, AssertUnwindSafe(unit).catch_unwind())
                .await
            {
                Ok(Ok(out)) => out,
                Ok(Err(payload)) => {
                    core.record_fatal(payload);
                    Err(Error::Panicked { task: label })
                }
                Err(origin) => Err(Error::Cancelled(origin)),
            };
            if background && matches!(out, Err(Error::Cancelled(_))) {
                core.confirm_background_cancelled(id);
            }
            core.on_child_done(id, out.as_ref().err());
            out
        };
        let join = tokio::spawn(context::scoped(Arc::clone(&child), stack, wrapper));

        Ok(ChildHandle { id, task: child, join })
    }

    /// Runs `body` with a handle to this group, then drains it.
    ///
    /// The body is a delivery point: a child failure cancels it at its
    /// current await. The group's own cancellation is replaced by the
    /// aggregate; an external one is re-propagated after the drain so an
    /// enclosing scope can catch it. A panic, in the body or any child,
    /// takes priority over everything else and resumes once the children
    /// are drained.
    pub async fn run<T, F, Fut>(&self, body: F) -> Result<T, Error>
    where
        F: FnOnce(TaskGroup) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        context::in_context(async {
            self.enter()?;
            let Some(task) = context::current_task() else {
                return Err(UsageError::NoTaskContext.into());
            };
            let mut guard = AbandonGuard::new(Arc::clone(&self.core));
            let outcome =
                match context::cancellable(&task, AssertUnwindSafe(body(self.clone())).catch_unwind())
                    .await
                {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(payload)) => {
                        self.core.record_fatal(payload);
                        Err(Error::Panicked {
                            task: self.core.name.clone(),
                        })
                    }
                    Err(origin) => Err(Error::Cancelled(origin)),
                };
            let result = self.exit(outcome).await;
            guard.disarm();
            result
        })
        .await
    }

    /// Closes the group: stops background children, settles cancellation
    /// attribution for `outcome`, and drains every child before returning.
    ///
    /// Paired with [`enter`](Self::enter) by [`run`](Self::run); exposed for
    /// integrations that manage the window themselves. Must be called on the
    /// task that entered the group.
    pub async fn exit<T>(&self, outcome: Result<T, Error>) -> Result<T, Error> {
        let core = &self.core;
        {
            let mut state = core.state.lock();
            if *state != GroupState::Open {
                return Err(UsageError::GroupNotOpen.into());
            }
            *state = GroupState::Draining;
        }
        let Some(parent) = core.parent.lock().clone() else {
            return Err(UsageError::GroupNotOpen.into());
        };
        core.exiting.store(true, Ordering::SeqCst);

        core.stop_background();

        // Classify the body's outcome before draining: an external
        // cancellation must come back after the drain, a self-requested one
        // is replaced by the aggregate, any real failure aborts the rest.
        let mut repropagate = None;
        match &outcome {
            Err(Error::Cancelled(origin)) if *origin != core.id => {
                repropagate = Some(*origin);
                core.abort();
            }
            Err(Error::Cancelled(_)) => {}
            Err(_) => core.abort(),
            Ok(_) => {
                if core.abort_requested.load(Ordering::SeqCst) {
                    core.abort();
                }
            }
        }

        // The drain is itself a delivery point. A cancellation landing here
        // re-aborts the children and is remembered, but never leaves them
        // running.
        loop {
            match context::cancellable(&parent, core.drained()).await {
                Ok(()) => break,
                Err(origin) => {
                    core.abort();
                    if origin != core.id && repropagate.is_none() {
                        repropagate = Some(origin);
                    }
                }
            }
        }

        if core.parent_cancel_requested.load(Ordering::SeqCst) {
            parent.retract(core.id);
        }

        let fatal = core.fatal.lock().take();
        core.close();
        if let Some(payload) = fatal {
            std::panic::resume_unwind(payload);
        }

        let mut errors = std::mem::take(&mut *core.errors.lock());
        if let Some(origin) = repropagate {
            if errors.is_empty() {
                return Err(Error::Cancelled(origin));
            }
        }
        match outcome {
            Ok(value) => {
                if errors.is_empty() {
                    Ok(value)
                } else {
                    Err(AggregateError::new(errors).into())
                }
            }
            Err(Error::Cancelled(origin)) => {
                if errors.is_empty() {
                    Err(Error::Cancelled(origin))
                } else {
                    Err(AggregateError::new(errors).into())
                }
            }
            Err(err) => {
                errors.push(err);
                Err(AggregateError::new(errors).into())
            }
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("name", &self.core.name)
            .field("state", &*self.core.state.lock())
            .field("pending", &self.core.pending.load(Ordering::SeqCst))
            .finish()
    }
}

/// Handle to one spawned child.
///
/// Await its result with [`join`](Self::join) or cancel it individually with
/// [`cancel`](Self::cancel). Dropping the handle detaches it from the
/// caller, not from the group.
pub struct ChildHandle<T> {
    id: CancelId,
    task: Arc<TaskContext>,
    join: JoinHandle<Result<T, Error>>,
}

impl<T> ChildHandle<T> {
    /// The child's cancellation identity.
    #[must_use]
    pub fn id(&self) -> CancelId {
        self.id
    }

    /// The child's label.
    #[must_use]
    pub fn name(&self) -> &str {
        self.task.label()
    }

    /// True once the child has finished, by any path.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Requests cancellation of this child alone.
    ///
    /// A child cancelled this way contributes nothing to the group's
    /// aggregate; [`join`](Self::join) reports [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.task.deliver(self.id);
    }

    /// Waits for the child and returns its result.
    pub async fn join(self) -> Result<T, Error> {
        match self.join.await {
            Ok(out) => out,
            Err(join_err) => {
                if join_err.is_panic() {
                    Err(Error::Panicked {
                        task: self.task.label().to_owned(),
                    })
                } else {
                    Err(Error::Cancelled(self.id))
                }
            }
        }
    }
}

impl<T> fmt::Debug for ChildHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildHandle")
            .field("name", &self.task.label())
            .field("finished", &self.join.is_finished())
            .finish()
    }
}
