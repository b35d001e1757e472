//! Singleflight: concurrent calls with the same key collapse into one
//! execution; followers wait on the winner's result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// Deduplicates in-flight work by string key. The winner runs the closure;
/// every concurrent caller with the same key receives a clone of its result.
/// Once the flight lands, the key is retired and later calls run fresh work.
pub struct Group<T: Clone + Send + Sync + 'static> {
    inflight: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Group { inflight: Mutex::new(HashMap::new()) }
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = {
            let mut inflight = match self.inflight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let value = cell.get_or_init(work).await.clone();

        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(current) = inflight.get(key) {
            if Arc::ptr_eq(current, &cell) {
                inflight.remove(key);
            }
        }
        value
    }

    /// Number of flights currently in the air.
    pub fn len(&self) -> usize {
        match self.inflight.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let group = Arc::new(Group::<usize>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("key", || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        42usize
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let group = Group::<&'static str>::new();
        let a = group.run("a", || async { "a" }).await;
        let b = group.run("b", || async { "b" }).await;
        assert_eq!((a, b), ("a", "b"));
    }

    #[tokio::test]
    async fn landed_flights_rerun() {
        let group = Group::<usize>::new();
        let first = group.run("k", || async { 1 }).await;
        let second = group.run("k", || async { 2 }).await;
        assert_eq!(first, 1);
        assert_eq!(second, 2, "a landed key must run fresh work");
    }
}
