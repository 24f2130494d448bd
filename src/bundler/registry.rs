use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// The live members of one bundler family, keyed (and therefore ordered) by bundler id.
///
/// A single mutex guards the whole set. Recomputation holds it for its full duration so every
/// member is read and written against one consistent snapshot. `parking_lot` releases the
/// lock during unwinding and does not poison it, so a panicking holder cannot wedge the
/// family.
#[derive(Debug)]
pub struct BundlerRegistry<T> {
    members: Mutex<BTreeMap<u64, Arc<T>>>,
}

impl<T> Default for BundlerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BundlerRegistry<T> {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns false if a member with this id was already present.
    pub fn register(&self, id: u64, member: Arc<T>) -> bool {
        self.members.lock().insert(id, member).is_none()
    }

    pub fn deregister(&self, id: u64) -> bool {
        self.members.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.members.lock().keys().copied().collect()
    }

    /// Lock the registry for a multi-step critical section.
    pub fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<T>>> {
        self.members.lock()
    }
}
