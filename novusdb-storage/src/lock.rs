//! Per-(collection, record-id) exclusive lock manager.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Contention policy chosen at manager creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Block until the lock is released or `timeout` elapses.
    Wait,
    /// Fail immediately with `LockHeld` if the record is already locked.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub collection: u32,
    pub record_id: u64,
}

struct Inner {
    held: HashSet<RecordKey>,
}

/// Guard released (and waiters notified) on drop.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: RecordKey,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.key);
    }
}

pub struct LockManager {
    policy: LockPolicy,
    timeout: Duration,
    state: Mutex<Inner>,
    cond: Condvar,
    /// Coarser lock serializing index-set updates for a single write.
    index_mutex: Mutex<()>,
}

impl LockManager {
    pub fn new(policy: LockPolicy) -> Self {
        Self::with_timeout(policy, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(policy: LockPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            timeout,
            state: Mutex::new(Inner {
                held: HashSet::new(),
            }),
            cond: Condvar::new(),
            index_mutex: Mutex::new(()),
        }
    }

    pub fn acquire(&self, collection: u32, record_id: u64) -> Result<LockGuard<'_>> {
        let key = RecordKey {
            collection,
            record_id,
        };
        let mut state = self.state.lock().unwrap();
        match self.policy {
            LockPolicy::Fail => {
                if state.held.contains(&key) {
                    return Err(Error::LockHeld(format!(
                        "collection {collection} record {record_id}"
                    )));
                }
                state.held.insert(key);
            }
            LockPolicy::Wait => {
                let deadline = Instant::now() + self.timeout;
                while state.held.contains(&key) {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::LockTimeout(format!(
                            "collection {collection} record {record_id}"
                        )));
                    }
                    let (guard, timeout_result) =
                        self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                    if timeout_result.timed_out() && state.held.contains(&key) {
                        return Err(Error::LockTimeout(format!(
                            "collection {collection} record {record_id}"
                        )));
                    }
                }
                state.held.insert(key);
            }
        }
        Ok(LockGuard {
            manager: self,
            key,
        })
    }

    fn release(&self, key: RecordKey) {
        let mut state = self.state.lock().unwrap();
        state.held.remove(&key);
        drop(state);
        self.cond.notify_all();
    }

    pub fn lock_index_set(&self) -> std::sync::MutexGuard<'_, ()> {
        self.index_mutex.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fail_policy_rejects_contended_lock() {
        let mgr = LockManager::new(LockPolicy::Fail);
        let _g1 = mgr.acquire(1, 10).unwrap();
        let err = mgr.acquire(1, 10).unwrap_err();
        assert!(matches!(err, Error::LockHeld(_)));
    }

    #[test]
    fn lock_release_unblocks_waiter() {
        let mgr = Arc::new(LockManager::with_timeout(
            LockPolicy::Wait,
            Duration::from_secs(2),
        ));
        let g1 = mgr.acquire(1, 10).unwrap();
        let mgr2 = mgr.clone();
        let handle = thread::spawn(move || {
            let _g = mgr2.acquire(1, 10).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        drop(g1);
        handle.join().unwrap();
    }

    #[test]
    fn wait_policy_times_out() {
        let mgr = LockManager::with_timeout(LockPolicy::Wait, Duration::from_millis(50));
        let _g1 = mgr.acquire(1, 10).unwrap();
        let err = mgr.acquire(1, 10).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }

    #[test]
    fn distinct_records_do_not_contend() {
        let mgr = LockManager::new(LockPolicy::Fail);
        let _g1 = mgr.acquire(1, 10).unwrap();
        let _g2 = mgr.acquire(1, 11).unwrap();
        let _g3 = mgr.acquire(2, 10).unwrap();
    }
}
