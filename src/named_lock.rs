//! Async locks keyed by name, created on demand and dropped once nobody holds or waits on them.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    holders: usize,
}

/// A set of async mutexes, one per name.
///
/// Holding the lock for `"a"` never blocks callers of `"b"`.
#[derive(Default)]
pub struct NamedLocks {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `name`.
    pub async fn lock(&self, name: &str) -> NamedLockGuard {
        let (lock, ticket) = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.entry(name.to_owned()).or_insert_with(|| Entry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            let ticket = Ticket {
                entries: Arc::clone(&self.entries),
                name: name.to_owned(),
            };
            (Arc::clone(&entry.lock), ticket)
        };
        // If this future is dropped while waiting, the ticket still unregisters the waiter.
        let guard = lock.lock_owned().await;
        NamedLockGuard {
            _guard: guard,
            _ticket: ticket,
        }
    }

    /// How many names are currently held or waited on.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Ticket {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    name: String,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.name) {
            entry.holders -= 1;
            if entry.holders == 0 {
                entries.remove(&self.name);
            }
        }
    }
}

/// Releases the named lock when dropped.
pub struct NamedLockGuard {
    // Fields drop in declaration order: the mutex is released before the entry is unregistered.
    _guard: OwnedMutexGuard<()>,
    _ticket: Ticket,
}
