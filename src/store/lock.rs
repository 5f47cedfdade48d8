//! Exclusive row locks keyed by row identity.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{StoreError, lock_state};

type Slots<K> = Arc<StdMutex<HashMap<K, Arc<Mutex<()>>>>>;

type LockFuture = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// Table of per-row mutexes. Slots are created on first use and removed
/// once nobody holds or waits for them.
pub(crate) struct LockTable<K> {
    slots: Slots<K>,
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Wait up to `wait` for the row lock on `key`.
    ///
    /// Cancelling the returned future gives the slot back like a timeout does.
    pub async fn acquire(&self, key: K, wait: Duration) -> Result<RowLock<K>, StoreError> {
        let slot = {
            let mut slots = lock_state(&self.slots);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut waiter = Waiter {
            lock: Box::pin(slot.lock_owned()),
            release: SlotRelease {
                key,
                slots: Arc::clone(&self.slots),
            },
        };
        let acquired = tokio::time::timeout(wait, waiter.lock.as_mut()).await;
        match acquired {
            Ok(guard) => Ok(RowLock {
                _guard: guard,
                _release: waiter.release,
            }),
            Err(_) => Err(StoreError::LockTimeout {
                resource: waiter.release.key.to_string(),
                waited: wait,
            }),
        }
    }

    #[cfg(test)]
    pub fn slot_count(&self) -> usize {
        lock_state(&self.slots).len()
    }
}

/// A pending acquisition. Fields drop in order, so the slot reference held
/// by `lock` is gone before `release` looks at the slot.
struct Waiter<K>
where
    K: Eq + Hash,
{
    lock: LockFuture,
    release: SlotRelease<K>,
}

/// Held row lock. Released on drop.
#[derive(Debug)]
pub(crate) struct RowLock<K>
where
    K: Eq + Hash,
{
    _guard: OwnedMutexGuard<()>,
    _release: SlotRelease<K>,
}

/// Removes the key's slot on drop if nothing else references it.
#[derive(Debug)]
struct SlotRelease<K>
where
    K: Eq + Hash,
{
    key: K,
    slots: Slots<K>,
}

impl<K> Drop for SlotRelease<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut slots = lock_state(&self.slots);
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}
