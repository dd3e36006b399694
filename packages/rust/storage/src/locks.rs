//! In-process per-key write locks.
//!
//! Upserts that touch the same identity key serialize here before they reach
//! the database; unrelated keys proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map size above which idle entries are pruned.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub(crate) struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Guards held for the duration of one write.
pub(crate) struct KeyGuards {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    /// Lock every key. Keys are taken in sorted order so two writers with
    /// overlapping key sets cannot deadlock.
    pub(crate) async fn acquire(&self, keys: impl IntoIterator<Item = String>) -> KeyGuards {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if map.len() > PRUNE_THRESHOLD {
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            keys.iter()
                .map(|k| map.entry(k.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for m in mutexes {
            guards.push(m.lock_owned().await);
        }
        KeyGuards { _guards: guards }
    }
}
