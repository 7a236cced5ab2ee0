//! Keyed single-flight locks
//!
//! At most one task at a time holds the guard for a given key within this
//! process. Entries are dropped from the map as soon as nobody holds or waits
//! on them, so the map only grows with the number of keys in active use.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One key's mutex and the number of guards (held or waiting) that use it
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

type SlotMap<K> = HashMap<K, Slot>;

/// Async mutex per key
#[derive(Clone)]
pub struct KeyedMutex<K> {
    slots: Arc<Mutex<SlotMap<K>>>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// The returned guard is registered before waiting starts, so a waiter
    /// cancelled mid-wait still gives up its claim on the map entry.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            slot.mutex.clone()
        };

        let mut guard = KeyedGuard {
            key,
            guard: None,
            slots: self.slots.clone(),
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    /// Number of keys currently held or awaited
    #[cfg(test)]
    pub(crate) fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one key, released on drop
pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<SlotMap<K>>>,
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        self.guard.take();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = KeyedMutex::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("session").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedMutex::new();
        let _a = locks.lock(("s", 0u64)).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(("s", 1u64))).await;
        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = KeyedMutex::new();
        {
            let _guard = locks.lock(7u32).await;
            assert_eq!(locks.active_keys(), 1);
        }
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_entry() {
        let locks = KeyedMutex::new();
        let holder = locks.lock(1u32).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(1u32).await;
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(holder);
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_key_usable_after_cancelled_waiter() {
        let locks = KeyedMutex::new();
        let holder = locks.lock("k").await;

        let waiting = tokio::time::timeout(Duration::from_millis(20), locks.lock("k")).await;
        assert!(waiting.is_err());

        drop(holder);
        assert_eq!(locks.active_keys(), 0);

        let reacquired = tokio::time::timeout(Duration::from_millis(100), locks.lock("k")).await;
        assert!(reacquired.is_ok());
    }
}
