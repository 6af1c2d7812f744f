//! Background children: stopped at group exit without counting as failures.

use std::future::Future;
use std::sync::Arc;

use crate::context::TaskContext;
use crate::errors::Error;
use crate::group::{ChildHandle, GroupCore, TaskGroup};

/// Shutdown bookkeeping for one background child.
///
/// `GroupCancelled` marks a child the group told to stop; when the child
/// then observes its cancellation, the wrapper confirms it. A background
/// child cancelled for any other reason keeps `Default` and is treated like
/// an ordinary child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackgroundState {
    Default,
    GroupCancelled,
    SelfCancelledConfirmed,
}

impl TaskGroup {
    /// Spawns a child expected to run until the group shuts it down.
    ///
    /// On exit the group cancels it before draining, cleanly or not, and its
    /// cancellation never appears in the aggregate. A background child that
    /// fails with a real error before being stopped is reported exactly like
    /// an ordinary child.
    pub fn spawn_background<T, F>(&self, unit: F) -> Result<ChildHandle<T>, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.spawn_inner(None, true, unit)
    }

    /// Spawns a labelled background child.
    pub fn spawn_background_named<T, F>(
        &self,
        name: impl Into<String>,
        unit: F,
    ) -> Result<ChildHandle<T>, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.spawn_inner(Some(name.into()), true, unit)
    }
}

impl GroupCore {
    /// Flags every live background child as group-cancelled, then delivers
    /// the cancellation. Runs at the start of the exit sequence on every
    /// path.
    pub(crate) fn stop_background(&self) {
        let victims: Vec<Arc<TaskContext>> = {
            let mut children = self.children.lock();
            children
                .values_mut()
                .filter(|record| record.background)
                .map(|record| {
                    record.bg = BackgroundState::GroupCancelled;
                    Arc::clone(&record.ctx)
                })
                .collect()
        };
        if !victims.is_empty() {
            tracing::debug!(group = %self.name, count = victims.len(), "stopping background tasks");
        }
        for ctx in victims {
            ctx.deliver(self.id);
        }
    }

    /// Called by a background child's wrapper when it went down cancelled:
    /// confirms an expected group shutdown, leaves anything else alone.
    pub(crate) fn confirm_background_cancelled(&self, id: crate::context::CancelId) {
        let mut children = self.children.lock();
        if let Some(record) = children.get_mut(&id) {
            if record.bg == BackgroundState::GroupCancelled {
                record.bg = BackgroundState::SelfCancelledConfirmed;
                tracing::debug!(child = %record.label, "background task stopped by group shutdown");
            }
        }
    }
}
