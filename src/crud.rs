//! In-memory keyed storage used by the memory history backend, the task
//! store and the trigger store.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug)]
pub struct MemCrud<T> {
    items: Mutex<HashMap<Uuid, T>>,
}

impl<T> Default for MemCrud<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> MemCrud<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Store `item` under a fresh id.
    pub fn create(&self, item: T) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(id, item);
        id
    }

    /// Store `item` under a caller-chosen id, replacing any previous value.
    pub fn insert(&self, id: Uuid, item: T) {
        self.lock().insert(id, item);
    }

    pub fn read(&self, id: &Uuid) -> Option<T> {
        self.lock().get(id).cloned()
    }

    /// Replace an existing item; returns the previous value, or `None` (and
    /// stores nothing) when `id` is unknown.
    pub fn update(&self, id: &Uuid, item: T) -> Option<T> {
        let mut items = self.lock();
        let slot = items.get_mut(id)?;
        Some(std::mem::replace(slot, item))
    }

    pub fn delete(&self, id: &Uuid) -> Option<T> {
        self.lock().remove(id)
    }

    pub fn list(&self) -> Vec<(Uuid, T)> {
        self.lock()
            .iter()
            .map(|(id, item)| (*id, item.clone()))
            .collect()
    }

    /// Drop every item `keep` rejects, returning how many were removed.
    pub fn retain(&self, mut keep: impl FnMut(&Uuid, &T) -> bool) -> usize {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|id, item| keep(id, item));
        before - items.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, T>> {
        // A poisoned map is still structurally valid.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_read_update_delete() {
        let crud = MemCrud::new();
        let id = crud.create("one".to_string());
        assert_eq!(crud.read(&id).as_deref(), Some("one"));

        assert_eq!(crud.update(&id, "two".to_string()).as_deref(), Some("one"));
        assert_eq!(crud.read(&id).as_deref(), Some("two"));
        assert!(crud.update(&Uuid::new_v4(), "x".to_string()).is_none());
        assert_eq!(crud.list().len(), 1);

        assert_eq!(crud.delete(&id).as_deref(), Some("two"));
        assert!(crud.read(&id).is_none());
    }

    #[test]
    fn default_needs_no_default_items() {
        #[derive(Clone)]
        struct NoDefault(u8);
        let crud: MemCrud<NoDefault> = MemCrud::default();
        assert!(crud.list().is_empty());
        let id = crud.create(NoDefault(7));
        assert_eq!(crud.read(&id).map(|v| v.0), Some(7));
    }

    #[test]
    fn retain_reports_removed_count() {
        let crud = MemCrud::new();
        crud.create(1);
        crud.create(2);
        crud.create(3);
        assert_eq!(crud.retain(|_, v| *v != 2), 1);
        assert_eq!(crud.list().len(), 2);
    }
}
