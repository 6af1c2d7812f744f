//! Cancellation scopes: deadline-bounded, manually cancellable regions of
//! execution.
//!
//! A scope imposes a deadline and/or an explicit [`cancel`](CancelScope::cancel)
//! on the code running inside its [`run`](CancelScope::run) block. On exit the
//! scope decides whether a cancellation travelling through the block was its
//! own: only then is it swallowed (`move_on_*`) or converted to
//! [`Error::Timeout`] (`fail_*`). A cancellation requested by an outer scope
//! passes through untouched.


use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::{self, CancelId};
use crate::errors::{Error, UsageError};

/// Lifecycle of a scope. Scopes are single-use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeStatus {
    Unentered,
    Entered,
    Exited,
}

/// Cancellation request state. `Prequeued` records a `cancel()` that arrived
/// before entry and must fire immediately on entry; `Called` means the
/// request has been delivered to the owner task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelStatus {
    None,
    Prequeued,
    Called,
}

struct ScopeInner {
    status: ScopeStatus,
    cancel_status: CancelStatus,
    deadline: Option<Instant>,
    caught: bool,
    owner: Option<Arc<context::TaskContext>>,
    /// Watcher task sleeping until the deadline. At most one armed at a time.
    timer: Option<JoinHandle<()>>,
}

/// Shared scope state; the deadline stack holds handles to this.
pub(crate) struct ScopeState {
    id: CancelId,
    raise_on_cancel: bool,
    inner: Mutex<ScopeInner>,
}

impl ScopeState {
    /// The scope's deadline while it is entered, for the effective-deadline
    /// query. Exited scopes lingering on a child's snapshot no longer count.
    pub(crate) fn active_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        if inner.status == ScopeStatus::Entered {
            inner.deadline
        } else {
            None
        }
    }

    fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.cancel_status == CancelStatus::Called {
            return;
        }
        match inner.status {
            ScopeStatus::Unentered => {
                inner.cancel_status = CancelStatus::Prequeued;
            }
            ScopeStatus::Entered => {
                inner.cancel_status = CancelStatus::Called;
                if let Some(timer) = inner.timer.take() {
                    timer.abort();
                }
                // delivered under the lock: an exit that observes `Called`
                // is then guaranteed to retract this delivery
                if let Some(owner) = inner.owner.clone() {
                    owner.deliver(self.id);
                }
            }
            ScopeStatus::Exited => {}
        }
    }
}

fn arm_timer(state: &Arc<ScopeState>, deadline: Instant) -> JoinHandle<()> {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        state.cancel();
    })
}

/// Restores the owner task when a `run` future is dropped mid-flight, for
/// example from a lost `select!` branch.
///
/// Dropping the future skips `exit`, which would otherwise leave the scope
/// entered forever: the timer stays armed, the dead deadline stays on the
/// stack, and a cancellation the timer already delivered is never retracted,
/// so it fires into whatever the task awaits next. The guard performs that
/// bookkeeping instead. No-op once the scope has exited.
struct ExitGuard {
    state: Arc<ScopeState>,
    armed: bool,
}

impl ExitGuard {
    fn new(state: Arc<ScopeState>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (owner, delivered) = {
            let mut inner = self.state.inner.lock();
            if inner.status != ScopeStatus::Entered {
                return;
            }
            inner.status = ScopeStatus::Exited;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            (
                inner.owner.take(),
                inner.cancel_status == CancelStatus::Called,
            )
        };
        context::pop_scope(&self.state);
        if delivered {
            if let Some(owner) = owner {
                owner.retract(self.state.id);
            }
        }
    }
}

/// A deadline-bounded, manually cancellable region of execution.
///
/// Handles are cheap clones of shared state, so the code inside the scope
/// (or a sibling task) can hold one to mutate the deadline or cancel:
///
/// ```rust,ignore
/// let scope = move_on_after(Duration::from_millis(100));
/// let out = scope
///     .run(async {
///         fetch_all().await?;
///         Ok(())
///     })
///     .await?;
/// if out.is_none() {
///     // deadline hit, partial results only
/// }
/// ```
#[derive(Clone)]
pub struct CancelScope {
    state: Arc<ScopeState>,
}

impl CancelScope {
    /// Creates an unentered scope that swallows its own cancellation.
    #[must_use]
    pub fn new(deadline: Option<Instant>) -> Self {
        Self::with_options(deadline, false)
    }

    /// Creates an unentered scope. With `raise_on_cancel`, a caught
    /// cancellation resurfaces as [`Error::Timeout`] instead of being
    /// swallowed.
    #[must_use]
    pub fn with_options(deadline: Option<Instant>, raise_on_cancel: bool) -> Self {
        Self {
            state: Arc::new(ScopeState {
                id: CancelId::new(),
                raise_on_cancel,
                inner: Mutex::new(ScopeInner {
                    status: ScopeStatus::Unentered,
                    cancel_status: CancelStatus::None,
                    deadline,
                    caught: false,
                    owner: None,
                    timer: None,
                }),
            }),
        }
    }

    /// Enters the scope on the current task: claims the owner slot, pushes
    /// onto the deadline stack, and arms the timer.
    ///
    /// A prequeued `cancel()` is delivered immediately and the effective
    /// deadline becomes "now". A deadline already in the past fires on the
    /// first await. Most callers want [`run`](Self::run) instead; `enter`
    /// and [`exit`](Self::exit) exist for integrations that need to manage
    /// the window themselves.
    pub fn enter(&self) -> Result<(), Error> {
        let Some(task) = context::current_task() else {
            return Err(UsageError::NoTaskContext.into());
        };
        {
            let mut inner = self.state.inner.lock();
            if inner.status != ScopeStatus::Unentered {
                return Err(UsageError::ScopeAlreadyEntered.into());
            }
            inner.status = ScopeStatus::Entered;
            inner.owner = Some(Arc::clone(&task));
        }
        context::push_scope(Arc::clone(&self.state));

        let mut inner = self.state.inner.lock();
        if inner.cancel_status == CancelStatus::Prequeued {
            inner.cancel_status = CancelStatus::Called;
            inner.deadline = Some(Instant::now());
            drop(inner);
            task.deliver(self.state.id);
        } else if inner.cancel_status != CancelStatus::Called {
            if let Some(deadline) = inner.deadline {
                inner.timer = Some(arm_timer(&self.state, deadline));
            }
        }
        Ok(())
    }

    /// Exits the scope with the block's outcome and resolves attribution.
    ///
    /// This scope caught the cancellation only if its own request was
    /// delivered, the owner's outstanding-request count returns to zero
    /// once that request is retracted, and the outcome is a cancellation.
    /// Caught: `Ok(None)` or [`Error::Timeout`] per `raise_on_cancel`.
    /// Not caught: the outcome propagates unchanged.
    pub fn exit<T>(&self, outcome: Result<T, Error>) -> Result<Option<T>, Error> {
        let (owner, delivered) = {
            let mut inner = self.state.inner.lock();
            if inner.status != ScopeStatus::Entered {
                return Err(UsageError::ScopeNotEntered.into());
            }
            inner.status = ScopeStatus::Exited;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            (
                inner.owner.take(),
                inner.cancel_status == CancelStatus::Called,
            )
        };
        context::pop_scope(&self.state);

        let Some(owner) = owner else {
            return outcome.map(Some);
        };
        let caught = if delivered {
            let remaining = owner.retract(self.state.id);
            remaining == 0 && matches!(outcome, Err(Error::Cancelled(_)))
        } else {
            false
        };

        if caught {
            self.state.inner.lock().caught = true;
            if self.state.raise_on_cancel {
                Err(Error::Timeout)
            } else {
                Ok(None)
            }
        } else {
            outcome.map(Some)
        }
    }

    /// Runs `body` inside the scope.
    ///
    /// The body is a delivery point: a cancellation aimed at this task drops
    /// it at its current await. `Ok(None)` means this scope's own
    /// cancellation was caught and swallowed. A panicking body still
    /// performs exit bookkeeping before the panic resumes, and dropping the
    /// future before completion restores the task the same way: the timer is
    /// disarmed, the scope leaves the stack, and a delivered request is
    /// retracted.
    pub async fn run<T, F>(&self, body: F) -> Result<Option<T>, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        context::in_context(async {
            self.enter()?;
            let Some(task) = context::current_task() else {
                return Err(UsageError::NoTaskContext.into());
            };
            let mut guard = ExitGuard::new(Arc::clone(&self.state));
            let outcome = match context::cancellable(&task, AssertUnwindSafe(body).catch_unwind())
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(payload)) => {
                    guard.disarm();
                    let _ = self.exit::<()>(Ok(()));
                    std::panic::resume_unwind(payload);
                }
                Err(origin) => Err(Error::Cancelled(origin)),
            };
            let result = self.exit(outcome);
            guard.disarm();
            result
        })
        .await
    }

    /// Requests cancellation of the code inside the scope.
    ///
    /// Idempotent beyond the first effective call. Before entry the request
    /// is queued and fires on entry.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// The scope's deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.state.inner.lock().deadline
    }

    /// Moves the deadline: disarms any armed timer and rearms for the new
    /// instant (immediately when already past). `None` disarms entirely.
    /// No-op when unchanged.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.state.inner.lock();
        if inner.deadline == deadline {
            return;
        }
        inner.deadline = deadline;
        if inner.status != ScopeStatus::Entered {
            return;
        }
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if inner.cancel_status == CancelStatus::Called {
            return;
        }
        if let Some(deadline) = deadline {
            inner.timer = Some(arm_timer(&self.state, deadline));
        }
    }

    /// Whether `cancel()` has been requested (including prequeued).
    #[must_use]
    pub fn cancel_called(&self) -> bool {
        self.state.inner.lock().cancel_status != CancelStatus::None
    }

    /// Whether this exact scope's cancellation was the one satisfied on
    /// exit. Becomes true at most once.
    #[must_use]
    pub fn cancelled_caught(&self) -> bool {
        self.state.inner.lock().caught
    }
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.inner.lock();
        f.debug_struct("CancelScope")
            .field("id", &self.state.id)
            .field("status", &inner.status)
            .field("cancel_status", &inner.cancel_status)
            .field("deadline", &inner.deadline)
            .field("caught", &inner.caught)
            .finish()
    }
}

/// Scope that swallows its own timeout after `timeout` from now.
#[must_use]
pub fn move_on_after(timeout: Duration) -> CancelScope {
    CancelScope::new(Some(Instant::now() + timeout))
}

/// Scope that swallows its own timeout at `deadline`.
#[must_use]
pub fn move_on_at(deadline: Instant) -> CancelScope {
    CancelScope::new(Some(deadline))
}

/// Scope that raises [`Error::Timeout`] after `timeout` from now.
#[must_use]
pub fn fail_after(timeout: Duration) -> CancelScope {
    CancelScope::with_options(Some(Instant::now() + timeout), true)
}

/// Scope that raises [`Error::Timeout`] at `deadline`.
#[must_use]
pub fn fail_at(deadline: Instant) -> CancelScope {
    CancelScope::with_options(Some(deadline), true)
}
