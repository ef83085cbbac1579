//! In-memory [`StateStore`]
//!
//! Useful on its own for tests and dry runs, and as the record cache of
//! persistent stores.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::context::{LockGuard, StateStore};
use crate::error::StoreError;
use crate::types::ResourceState;

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State records held in memory, with per-id exclusive sections
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<String, ResourceState>>,
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records
    pub fn with_records(records: impl IntoIterator<Item = ResourceState>) -> Self {
        let store = Self::new();
        {
            let mut map = lock_unpoisoned(&store.records);
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }

    /// Copy of every record, keyed by id
    pub fn snapshot(&self) -> BTreeMap<String, ResourceState> {
        lock_unpoisoned(&self.records).clone()
    }

    /// Whether some caller currently holds the lock for `id`
    pub fn is_locked(&self, id: &str) -> bool {
        lock_unpoisoned(&self.held).contains(id)
    }

    fn release(&self, id: &str) {
        lock_unpoisoned(&self.held).remove(id);
        self.released.notify_all();
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, id: &str) -> Result<Option<ResourceState>, StoreError> {
        Ok(lock_unpoisoned(&self.records).get(id).cloned())
    }

    fn put(&self, state: ResourceState) -> Result<(), StoreError> {
        lock_unpoisoned(&self.records).insert(state.id.clone(), state);
        Ok(())
    }

    fn lock(&self, id: &str, timeout: Duration) -> Result<LockGuard<'_>, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut held = lock_unpoisoned(&self.held);

        while held.contains(id) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockTimeout {
                    id: id.to_string(),
                    timeout,
                });
            }
            held = match self.released.wait_timeout(held, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        held.insert(id.to_string());
        drop(held);

        let owned = id.to_string();
        Ok(LockGuard::new(id, move || self.release(&owned)))
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(lock_unpoisoned(&self.records).keys().cloned().collect())
    }
}
