//! In-process exclusion between writes and deletes of the same object.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

type Key = (String, String);

/// Objects currently being written, keyed by `(folder, object)`.
#[derive(Default)]
pub struct ObjectLocks {
    held: Arc<DashMap<Key, ()>>,
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an object. `None` when someone else holds it.
    pub fn try_lock(&self, folder_id: &str, object_id: &str) -> Option<ObjectGuard> {
        let key = (folder_id.to_string(), object_id.to_string());
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(ObjectGuard {
                    held: Arc::clone(&self.held),
                    key,
                })
            }
        }
    }

    pub fn is_locked(&self, folder_id: &str, object_id: &str) -> bool {
        self.held
            .contains_key(&(folder_id.to_string(), object_id.to_string()))
    }

    /// Whether any object of the folder is being written.
    pub fn is_container_busy(&self, folder_id: &str) -> bool {
        self.held.iter().any(|entry| entry.key().0 == folder_id)
    }
}

/// Releases the object when dropped.
pub struct ObjectGuard {
    held: Arc<DashMap<Key, ()>>,
    key: Key,
}

impl Drop for ObjectGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_fails_until_release() {
        let locks = ObjectLocks::new();
        let guard = locks.try_lock("f", "o").unwrap();

        assert!(locks.try_lock("f", "o").is_none());
        assert!(locks.is_locked("f", "o"));
        assert!(locks.is_container_busy("f"));
        assert!(!locks.is_container_busy("g"));

        drop(guard);
        assert!(!locks.is_locked("f", "o"));
        assert!(locks.try_lock("f", "o").is_some());
    }

    #[test]
    fn different_objects_do_not_conflict() {
        let locks = ObjectLocks::new();
        let _a = locks.try_lock("f", "a").unwrap();
        let _b = locks.try_lock("f", "b").unwrap();
        let _c = locks.try_lock("g", "a").unwrap();
    }
}
