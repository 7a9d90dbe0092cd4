//! Storage lock context
//!
//! One context may be shared by several storages. The lock is re-entrant so
//! a thread can hold several page guards at once (node, parent and sibling
//! during a split) without deadlocking itself.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::sync::Arc;

/// Held for as long as a page borrow is alive
pub type StorageGuard<'a> = ReentrantMutexGuard<'a, ()>;

#[derive(Clone)]
pub struct StorageLockContext {
    lock: Arc<ReentrantMutex<()>>,
}

impl StorageLockContext {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Block until the context is available to this thread
    pub fn lock(&self) -> StorageGuard<'_> {
        self.lock.lock()
    }

    pub fn try_lock(&self) -> Option<StorageGuard<'_>> {
        self.lock.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// True if both handles guard the same lock
    pub fn shares_with(&self, other: &StorageLockContext) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }
}

impl Default for StorageLockContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StorageLockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLockContext")
            .field("locked", &self.is_locked())
            .finish()
    }
}
