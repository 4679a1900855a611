//! Poison recovery for the engine's shared-state locks.
//!
//! A panicked task must not wedge sibling requests behind a `PoisonError`:
//! everything the engine guards with a std lock (pending completions,
//! heartbeat tables, the active policy snapshot) is reconstructible from the
//! durable stores or the next sync delivery, so recovery keeps the guard and
//! carries on with whatever state the lock holds.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<Guard>(result: Result<Guard, PoisonError<Guard>>, site: &'static str) -> Guard {
    result.unwrap_or_else(|poisoned| {
        warn!(
            site,
            "lock poisoned by a panicked task; continuing with possibly stale state"
        );
        poisoned.into_inner()
    })
}

/// Poison-tolerant acquisition for `Mutex`, tagged with the call site.
pub(crate) trait MutexExt<T> {
    fn lock_or_recover(&self, site: &'static str) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_or_recover(&self, site: &'static str) -> MutexGuard<'_, T> {
        recover(self.lock(), site)
    }
}

/// Poison-tolerant acquisition for `RwLock`, tagged with the call site.
pub(crate) trait RwLockExt<T> {
    fn read_or_recover(&self, site: &'static str) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self, site: &'static str) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_or_recover(&self, site: &'static str) -> RwLockReadGuard<'_, T> {
        recover(self.read(), site)
    }

    fn write_or_recover(&self, site: &'static str) -> RwLockWriteGuard<'_, T> {
        recover(self.write(), site)
    }
}
