//! Concurrent registry of active downloads
//!
//! An insertion-ordered list behind a reader/writer lock. Readers share the
//! lock, writers hold it exclusively for the length of the structural change.
//! Predicates run under the lock and must not call back into the registry;
//! `for_each` works on a snapshot so its closure is free to do so.

use parking_lot::RwLock;

/// Result of a removal, computed under the same write lock
#[derive(Debug)]
pub struct Removal<T> {
    pub removed: Vec<T>,
    /// True when the registry became empty because of this removal
    pub drained: bool,
}

/// Thread-safe ordered container
#[derive(Debug)]
pub struct ConcurrentRegistry<T> {
    items: RwLock<Vec<T>>,
}

impl<T> Default for ConcurrentRegistry<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Clone + PartialEq> ConcurrentRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Item at `index`, if in range
    pub fn get(&self, index: usize) -> Option<T> {
        self.items.read().get(index).cloned()
    }

    /// Replace the item at `index`. Returns false if out of range.
    pub fn set(&self, index: usize, item: T) -> bool {
        let mut items = self.items.write();
        match items.get_mut(index) {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        }
    }

    /// Append `item`. Returns false if an equal item is already present.
    pub fn insert(&self, item: T) -> bool {
        let mut items = self.items.write();
        if items.contains(&item) {
            return false;
        }
        items.push(item);
        true
    }

    /// Append `item` unless some present item matches `conflict`.
    ///
    /// The check and the append happen under one write lock.
    pub fn insert_unless<F>(&self, item: T, conflict: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let mut items = self.items.write();
        if items.iter().any(|existing| conflict(existing) || *existing == item) {
            return false;
        }
        items.push(item);
        true
    }

    /// Remove every matching item
    pub fn remove_where<F>(&self, predicate: F) -> Removal<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut items = self.items.write();
        let was_empty = items.is_empty();
        let mut removed = Vec::new();
        items.retain(|item| {
            if predicate(item) {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });
        let drained = !was_empty && !removed.is_empty() && items.is_empty();
        Removal { removed, drained }
    }

    /// Remove everything, returning what was held
    pub fn remove_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.write())
    }

    pub fn first_where<F>(&self, predicate: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        self.items.read().iter().find(|item| predicate(item)).cloned()
    }

    pub fn filter<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.items
            .read()
            .iter()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }

    pub fn contains<F>(&self, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.items.read().iter().any(|item| predicate(item))
    }

    pub fn map<R, F>(&self, transform: F) -> Vec<R>
    where
        F: Fn(&T) -> R,
    {
        self.items.read().iter().map(transform).collect()
    }

    /// Visit a snapshot of the items in insertion order
    pub fn for_each<F>(&self, mut body: F)
    where
        F: FnMut(&T),
    {
        let snapshot = self.snapshot();
        snapshot.iter().for_each(|item| body(item));
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items.read().clone()
    }
}
