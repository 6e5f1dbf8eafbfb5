//! Per-key async mutual exclusion.
//!
//! Used by the image cache (one downloader per cache entry) and by the
//! pipeline (one mutating operation per VM ID). Entries are dropped from the
//! map once nobody holds or waits for them. A waiter that is cancelled after
//! the holder released leaves its entry behind; such entries are pruned on
//! the next `lock` or `active_keys` call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Drop entries only the map still references.
fn prune(map: &mut HashMap<String, Arc<AsyncMutex<()>>>) {
    map.retain(|_, entry| Arc::strong_count(entry) > 1);
}

/// A set of named async locks.
#[derive(Default, Clone)]
pub struct KeyedLocks {
    locks: LockMap,
}

/// Held lock for one key. Releases on drop.
pub struct KeyedGuard {
    key: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let entry = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            prune(&mut map);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = entry.lock_owned().await;

        KeyedGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut map);
        map.len()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Release first so the count below only sees the map and any waiters.
        self.guard.take();
        if let Some(entry) = map.get(&self.key) {
            if Arc::strong_count(entry) == 1 {
                map.remove(&self.key);
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
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("image.qcow2").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("vm-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("vm-b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_entry() {
        let locks = KeyedLocks::new();
        let holder = locks.lock("image.qcow2").await;

        let mut waiter = Box::pin(locks.lock("image.qcow2"));
        assert!(futures::poll!(&mut waiter).is_pending());

        // Released while the waiter is still queued, then the waiter gives up.
        drop(holder);
        drop(waiter);

        assert_eq!(locks.active_keys(), 0);
        let again = tokio::time::timeout(Duration::from_millis(100), locks.lock("image.qcow2")).await;
        assert!(again.is_ok());
    }
}
