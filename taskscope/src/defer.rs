//! Deferred cleanup: teardown registered during a unit of work runs in
//! reverse order on every exit path.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::warn;

use crate::context;
use crate::errors::{Error, UsageError};

type SyncCleanup = Box<dyn FnOnce() + Send + 'static>;
type AsyncCleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

enum Cleanup {
    Sync(SyncCleanup),
    Async(AsyncCleanup),
}

/// Registrar handed to a [`with_deferred`] body.
///
/// Clones share one cleanup stack, so the registrar can be moved into
/// helpers that acquire resources on the body's behalf.
#[derive(Clone)]
pub struct Deferrer {
    cleanups: Arc<Mutex<Vec<Cleanup>>>,
}

impl Deferrer {
    fn new() -> Self {
        Self {
            cleanups: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a synchronous cleanup.
    pub fn defer<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanups.lock().push(Cleanup::Sync(Box::new(cleanup)));
    }

    /// Registers an asynchronous cleanup.
    pub fn defer_async<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cleanups
            .lock()
            .push(Cleanup::Async(Box::new(move || cleanup().boxed())));
    }

    /// Number of cleanups registered and not yet run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.cleanups.lock().len()
    }

    /// Runs the stack in reverse-registration order.
    ///
    /// A panicking cleanup is logged and does not stop the rest. The awaits
    /// inside async cleanups are not delivery points, so teardown is never
    /// cut short by a pending cancellation.
    async fn run_all(&self) {
        loop {
            let next = self.cleanups.lock().pop();
            let Some(cleanup) = next else { break };
            match cleanup {
                Cleanup::Sync(f) => {
                    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                        warn!("deferred cleanup panicked");
                    }
                }
                Cleanup::Async(f) => {
                    if AssertUnwindSafe(f()).catch_unwind().await.is_err() {
                        warn!("deferred cleanup panicked");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Deferrer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferrer")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Runs `body` with a cleanup registrar.
///
/// Everything registered on the [`Deferrer`] runs when the body finishes,
/// newest first, on success, failure, cancellation, and panic alike. The
/// body is a delivery point; a cancellation dropped into it still gets its
/// cleanups before the result propagates.
///
/// ```no_run
/// use taskscope::{with_deferred, Error};
///
/// # async fn demo() -> Result<(), Error> {
/// with_deferred(|d| async move {
///     let conn = "connection";
///     d.defer(move || println!("closing {conn}"));
///     Ok(())
/// })
/// .await
/// # }
/// ```
pub async fn with_deferred<T, F, Fut>(body: F) -> Result<T, Error>
where
    F: FnOnce(Deferrer) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    context::in_context(async {
        let Some(task) = context::current_task() else {
            return Err(UsageError::NoTaskContext.into());
        };
        let deferrer = Deferrer::new();
        let cleanups = deferrer.clone();
        let outcome = match context::cancellable(
            &task,
            AssertUnwindSafe(body(deferrer)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(payload)) => {
                cleanups.run_all().await;
                std::panic::resume_unwind(payload);
            }
            Err(origin) => Err(Error::Cancelled(origin)),
        };
        cleanups.run_all().await;
        outcome
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use crate::defer::with_deferred;
    use crate::errors::Error;
    use crate::scope::move_on_after;

    #[tokio::test]
    async fn test_cleanups_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let result = with_deferred(|d| {
            let order = order.clone();
            async move {
                for n in 1..=3 {
                    let order = order.clone();
                    d.defer(move || order.lock().push(n));
                }
                assert_eq!(d.pending(), 3);
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Ok(())));
        assert_eq!(*order.lock(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_cleanup_runs_on_error() {
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let result: Result<(), Error> = with_deferred(|d| async move {
            d.defer(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            });
            Err(Error::msg("setup failed"))
        })
        .await;

        assert!(matches!(result, Err(Error::App(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_on_cancellation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scope = move_on_after(Duration::from_millis(10));

        let counter_clone = counter.clone();
        let result = scope
            .run(async move {
                with_deferred(|d| async move {
                    d.defer(move || {
                        counter_clone.fetch_add(1, Ordering::SeqCst);
                    });
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
                .await
            })
            .await;

        assert!(matches!(result, Ok(None)));
        assert!(scope.cancelled_caught());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_and_async_cleanups_interleave() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let result = with_deferred(|d| {
            let order = order.clone();
            async move {
                let o1 = order.clone();
                d.defer(move || o1.lock().push("sync-first"));
                let o2 = order.clone();
                d.defer_async(move || async move {
                    tokio::task::yield_now().await;
                    o2.lock().push("async-second");
                });
                let o3 = order.clone();
                d.defer(move || o3.lock().push("sync-third"));
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Ok(())));
        assert_eq!(*order.lock(), vec!["sync-third", "async-second", "sync-first"]);
    }

    #[tokio::test]
    async fn test_panicking_cleanup_does_not_stop_the_rest() {
        let counter = Arc::new(AtomicUsize::new(0));

        let c1 = counter.clone();
        let c2 = counter.clone();
        let result = with_deferred(|d| async move {
            d.defer(move || {
                c1.fetch_add(1, Ordering::SeqCst);
            });
            d.defer(|| panic!("cleanup exploded"));
            d.defer(move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        })
        .await;

        assert!(matches!(result, Ok(())));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleanup_runs_when_body_panics() {
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let join = tokio::spawn(async move {
            with_deferred(|d| async move {
                d.defer(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                });
                if true {
                    panic!("body exploded");
                }
                Ok(())
            })
            .await
        });

        let err = join.await.unwrap_err();
        assert!(err.is_panic());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
