//! Named mutexes, allocated on first use.
//!
//! The reconciler serializes claims on a shared fixed-tag pool with these:
//! two Pods racing for the same tag key would otherwise both see the same
//! unassociated address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyLock {
    // outer guard makes the allocate-or-get step atomic
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex for `key`, creating it on first use. The returned
    /// guard releases the lock when dropped.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
