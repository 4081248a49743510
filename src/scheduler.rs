//! Bounded-concurrency task runner.
//!
//! [`run_pool`] drives at most `limit` invocations of a worker over a list
//! of items. Workers share one cursor: each claims the next unclaimed item,
//! awaits the worker on it, and loops. All workers are polled from the
//! caller's task, so nothing here needs `Send` or spawns.

use std::future::Future;
use std::sync::Mutex;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

/// Result of a pool run.
#[derive(Debug)]
pub struct PoolOutcome<R> {
    /// Worker outputs in input order. Items never claimed are absent.
    pub results: Vec<R>,
    /// Number of items left unclaimed because of cancellation.
    pub unclaimed: usize,
}

impl<R> PoolOutcome<R> {
    /// Returns true if cancellation stopped the pool early.
    #[must_use]
    pub const fn was_cancelled(&self) -> bool {
        self.unclaimed > 0
    }
}

/// Runs `worker` over `items` with at most `limit` invocations in flight.
///
/// Cancellation is cooperative: once `cancel` fires no new item is claimed,
/// but items already claimed run to completion.
pub async fn run_pool<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    cancel: &CancellationToken,
    worker: F,
) -> PoolOutcome<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let total = items.len();
    let slots = limit.max(1).min(total);
    let cursor = Mutex::new(items.into_iter().enumerate());
    let done: Mutex<Vec<(usize, R)>> = Mutex::new(Vec::with_capacity(total));

    let claim = || -> Option<(usize, T)> {
        if cancel.is_cancelled() {
            return None;
        }
        cursor.lock().ok()?.next()
    };

    let workers = (0..slots).map(|_| async {
        while let Some((index, item)) = claim() {
            let output = worker(item).await;
            if let Ok(mut done) = done.lock() {
                done.push((index, output));
            }
        }
    });
    join_all(workers).await;

    let mut results = done.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
    results.sort_by_key(|(index, _)| *index);
    let unclaimed = total - results.len();
    PoolOutcome {
        results: results.into_iter().map(|(_, r)| r).collect(),
        unclaimed,
    }
}
