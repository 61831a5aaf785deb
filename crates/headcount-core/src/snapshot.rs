//! Publish-by-swap cell for read-mostly shared state.

use std::sync::{Arc, RwLock};

/// Holds an `Arc<T>` that writers replace wholesale.
///
/// Readers clone the current `Arc` and then work against that fixed value
/// with no lock held; the lock only guards the pointer itself. A writer
/// builds the replacement off to the side and installs it in one step, so
/// no reader ever sees a partially built value.
pub struct SnapshotCell<T> {
    current: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install `value`, returning the previous snapshot.
    pub fn publish(&self, value: T) -> Arc<T> {
        let next = Arc::new(value);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}
