//! Per-key advisory lock with bounded wait.
//!
//! Serializes read-modify-write sequences that touch several maps for the same
//! key (a consumer id, a topic name) while unrelated keys proceed concurrently.

use crate::MasterError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RowLock {
    name: String,
    wait: Duration,
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Releases the key when dropped, including on early returns and panics.
#[must_use = "the row is unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RowLockGuard<'a> {
    lock: &'a RowLock,
    key: String,
}

impl RowLock {
    pub fn new(name: impl Into<String>, wait: Duration) -> Self {
        Self {
            name: name.into(),
            wait,
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Block until `key` is free or the configured wait elapses.
    pub fn acquire(&self, key: &str) -> Result<RowLockGuard<'_>, MasterError> {
        let deadline = Instant::now() + self.wait;
        let mut held = self.held.lock();
        while held.contains(key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(key) {
                return Err(MasterError::LockTimeout {
                    lock: self.name.clone(),
                    key: key.to_string(),
                });
            }
        }
        held.insert(key.to_string());
        Ok(RowLockGuard {
            lock: self,
            key: key.to_string(),
        })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl RowLockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RowLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.lock().remove(&self.key);
        self.lock.released.notify_all();
    }
}
