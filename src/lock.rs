//! Lock Manager: a single process-wide reader/writer lock guarding the
//! entire logical filesystem.
//!
//! Read operations (`cd`, `list`, `read`/`download`) take the shared mode;
//! mutating operations take the exclusive mode. The lock spans both the
//! syscall(s) and the associated metadata update so other sessions never
//! observe the two out of sync. A fine-grained per-path lock table was
//! considered but isn't wired in here; one global lock is simpler and the
//! whole tree is small enough that contention isn't a concern.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Guards the whole exported filesystem plus its metadata side-car.
#[derive(Debug, Default)]
pub struct LockManager {
    lock: RwLock<()>,
}

impl LockManager {
    pub fn new() -> Self {
        Self { lock: RwLock::new(()) }
    }

    /// Acquire shared access for a read-only filesystem operation.
    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Acquire exclusive access for a mutating filesystem operation.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }
}
