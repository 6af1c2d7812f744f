//! Effective deadline lookup across the active scope stack.

use tokio::time::Instant;

use crate::context;

/// Returns the earliest deadline among the scopes active on the current task.
///
/// The result reflects live scope state: arming, moving, or disarming a
/// deadline changes the answer immediately. Subtasks inherit the scopes that
/// were active on their parent at spawn time, so the lookup works inside
/// spawned children as well.
///
/// Returns `None` outside a task context or when no active scope carries a
/// deadline.
#[must_use]
pub fn effective_deadline() -> Option<Instant> {
    context::with_stack(|stack| {
        stack
            .iter()
            .filter_map(|scope| scope.active_deadline())
            .min()
    })
    .flatten()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    use crate::deadline::effective_deadline;
    use crate::group::TaskGroup;
    use crate::scope::{move_on_after, CancelScope};

    #[tokio::test]
    async fn test_none_without_active_deadline() {
        assert_eq!(effective_deadline(), None);

        let scope = CancelScope::new(None);
        let result = scope
            .run(async {
                assert_eq!(effective_deadline(), None);
                Ok(())
            })
            .await;
        assert!(matches!(result, Ok(Some(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_innermost_minimum_wins() {
        let outer = move_on_after(Duration::from_secs(3600));
        let inner = move_on_after(Duration::from_millis(10));
        let outer_d = outer.deadline();
        let inner_d = inner.deadline();

        let inner_body = inner.clone();
        let result = outer
            .run(async move {
                assert_eq!(effective_deadline(), outer_d);
                let out = inner_body
                    .run(async move {
                        assert_eq!(effective_deadline(), inner_d);
                        Ok(())
                    })
                    .await?;
                assert!(out.is_some());
                // the inner scope has exited, its deadline no longer applies
                assert_eq!(effective_deadline(), outer_d);
                Ok(())
            })
            .await;

        assert!(matches!(result, Ok(Some(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_children_inherit_spawner_stack() {
        let scope = move_on_after(Duration::from_secs(60));
        let scope_d = scope.deadline();

        let result = scope
            .run(async move {
                let group = TaskGroup::new();
                group
                    .run(|g| async move {
                        let sampler = g.spawn(async { Ok(effective_deadline()) })?;
                        assert_eq!(sampler.join().await?, scope_d);
                        Ok(())
                    })
                    .await
            })
            .await;

        assert!(matches!(result, Ok(Some(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_siblings_do_not_share_scopes() {
        let outer = move_on_after(Duration::from_secs(3600));
        let outer_d = outer.deadline();

        let result = outer
            .run(async move {
                let group = TaskGroup::new();
                group
                    .run(|g| async move {
                        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
                        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
                        g.spawn(async move {
                            let tight = move_on_after(Duration::from_millis(10));
                            tight
                                .run(async move {
                                    let _ = entered_tx.send(());
                                    let _ = done_rx.await;
                                    Ok(())
                                })
                                .await?;
                            Ok(())
                        })?;
                        let sampler = g.spawn(async move {
                            let _ = entered_rx.await;
                            Ok(effective_deadline())
                        })?;
                        let seen = sampler.join().await?;
                        let _ = done_tx.send(());
                        // the sibling's scope was live, but never on this stack
                        assert_eq!(seen, outer_d);
                        Ok(())
                    })
                    .await
            })
            .await;

        assert!(matches!(result, Ok(Some(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_mutation_is_visible() {
        let scope = move_on_after(Duration::from_millis(10));
        let handle = scope.clone();

        let result = scope
            .run(async move {
                let later = Instant::now() + Duration::from_secs(5);
                handle.set_deadline(Some(later));
                assert_eq!(effective_deadline(), Some(later));

                handle.set_deadline(None);
                assert_eq!(effective_deadline(), None);
                Ok(())
            })
            .await;

        assert!(matches!(result, Ok(Some(()))));
    }
}
