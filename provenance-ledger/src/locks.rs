//! Keyed async mutexes for per-entity serialization

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per key, created on demand
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Guards held for a set of keys
#[derive(Debug)]
pub struct KeyedGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    /// Empty lock set
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock a single key
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        self.lock_all([key]).await
    }

    /// Lock several keys
    ///
    /// Keys are taken in sorted order with duplicates removed, so two callers
    /// locking overlapping sets cannot deadlock.
    pub async fn lock_all<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> KeyedGuard {
        let mut keys: Vec<&str> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.slot(key).lock_owned().await);
        }
        KeyedGuard { _guards: guards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let counter = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let guard = locks.lock("drug:D1").await;
        let task = {
            let locks = locks.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let _g = locks.lock_all(["shipment:S1", "drug:D1"]).await;
                counter.lock().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        counter.lock().push("first");
        drop(guard);
        task.await.unwrap();

        assert_eq!(*counter.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("drug:D1").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock("drug:D2"))
            .await
            .unwrap();
    }
}
