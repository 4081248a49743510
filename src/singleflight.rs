//! Keyed single-flight execution.
//!
//! Concurrent callers asking for the same key share one in-flight future;
//! the entry is dropped once that future resolves, so a later call starts
//! fresh.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

/// Collapses concurrent work for the same key into one execution.
pub struct SingleFlight<K, V>
where
    V: Clone,
{
    inflight: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    V: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty single-flight group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `make()` for `key` unless a call for the same key is already in
    /// flight, in which case its result is awaited instead.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.lock();
            if let Some(existing) = inflight.get(&key) {
                existing.clone()
            } else {
                let flight = make().boxed().shared();
                inflight.insert(key.clone(), flight.clone());
                flight
            }
        };

        let value = flight.clone().await;

        let mut inflight = self.lock();
        if inflight.get(&key).is_some_and(|current| current.ptr_eq(&flight)) {
            inflight.remove(&key);
        }
        value
    }

    /// Number of keys with work in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Shared<BoxFuture<'static, V>>>> {
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let group: SingleFlight<u32, String> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let make = || {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                "minted".to_string()
            }
        };

        let (a, b, c) = tokio::join!(
            group.run(7, make()),
            group.run(7, make()),
            group.run(7, make()),
        );
        assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("minted", "minted", "minted"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let group: SingleFlight<u32, u32> = SingleFlight::new();
        let (a, b) = tokio::join!(group.run(1, || async { 10 }), group.run(2, || async { 20 }));
        assert_eq!((a, b), (10, 20));
    }

    #[tokio::test]
    async fn finished_key_runs_again() {
        let group: SingleFlight<&'static str, usize> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            group
                .run("k", move || async move { calls.fetch_add(1, Ordering::SeqCst) })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
