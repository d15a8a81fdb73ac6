//! Single-flight deduplication of concurrent requests.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::OnceCell;

/// Runs at most one future per key at a time; concurrent callers with the same key share its
/// output.
///
/// An entry lives only while its flight is running, so a later call with the same key starts
/// afresh. If the leading caller is dropped before finishing, the next waiter takes over.
#[derive(Debug)]
pub struct InFlight<K, V> {
    flights: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for InFlight<K, V> {
    fn default() -> Self {
        InFlight {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> InFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the output of the flight for `key`, starting one with `f` if none is running.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = self
            .flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();

        let value = cell.get_or_init(f).await.clone();

        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if flights
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            flights.remove(&key);
        }
        value
    }

    /// The number of flights currently running.
    pub fn len(&self) -> usize {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use similar_asserts::assert_eq;
    use tokio::sync::Notify;

    use super::*;

    #[tokio::test]
    async fn test_shared_flight() {
        let inflight = InFlight::<&str, usize>::new();
        let runs = &AtomicUsize::new(0);
        let gate = &Notify::new();

        let flight = || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            42
        };
        let release = async {
            while runs.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            gate.notify_one();
        };

        let (a, b, ()) = tokio::join!(
            inflight.run("key", flight),
            inflight.run("key", flight),
            release
        );
        assert_eq!((a, b), (42, 42));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());

        // A finished flight is not cached.
        let c = inflight.run("key", || async { 7 }).await;
        assert_eq!(c, 7);
    }

    #[tokio::test]
    async fn test_distinct_keys() {
        let inflight = InFlight::<u32, u32>::new();
        let (a, b) = tokio::join!(
            inflight.run(1, || async { 10 }),
            inflight.run(2, || async { 20 })
        );
        assert_eq!((a, b), (10, 20));
        assert_eq!(inflight.len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_leader() {
        let inflight = InFlight::<&str, &str>::new();
        {
            let leader = inflight.run("key", || std::future::pending::<&str>());
            // Poll once so the leader owns the flight, then drop it.
            tokio::select! {
                biased;
                _ = leader => unreachable!(),
                _ = tokio::task::yield_now() => {}
            }
        }
        let value = inflight.run("key", || async { "follower" }).await;
        assert_eq!(value, "follower");
        assert!(inflight.is_empty());
    }
}
