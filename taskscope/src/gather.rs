//! Run a batch of units concurrently and collect their results.

use std::future::Future;

use crate::errors::Error;
use crate::group::TaskGroup;

/// Runs every unit concurrently and returns their values in call order.
///
/// Backed by a fresh [`TaskGroup`]: one unit's failure cancels the others,
/// and the group's [`AggregateError`](crate::AggregateError) carries the
/// failure out. An empty batch resolves to an empty `Vec`.
pub async fn gather<T, F>(units: impl IntoIterator<Item = F>) -> Result<Vec<T>, Error>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Error>> + Send + 'static,
{
    let group = TaskGroup::named("gather");
    group
        .run(|g| async move {
            let handles = units
                .into_iter()
                .map(|unit| g.spawn(unit))
                .collect::<Result<Vec<_>, Error>>()?;
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                // per-child failures are raised by the group's aggregate
                if let Ok(value) = handle.join().await {
                    results.push(value);
                }
            }
            Ok(results)
        })
        .await
}

/// Like [`gather`], but a unit's failure is captured in its slot instead of
/// cancelling the batch.
///
/// Always runs every unit to completion and preserves call order, so the
/// caller can pair each result with its unit.
pub async fn gather_settled<T, F>(
    units: impl IntoIterator<Item = F>,
) -> Result<Vec<Result<T, Error>>, Error>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Error>> + Send + 'static,
{
    let group = TaskGroup::named("gather");
    group
        .run(|g| async move {
            let handles = units
                .into_iter()
                .map(|unit| g.spawn(async move { Ok(unit.await) }))
                .collect::<Result<Vec<_>, Error>>()?;
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(handle.join().await?);
            }
            Ok(results)
        })
        .await
}
