//! Keyed cache entries that can tell a pushed update from an older fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entries keyed by id or instrument name.
///
/// Every pushed write (store or removal) bumps a sequence number. While a
/// [`FetchWindow`] is open the key's sequence is remembered, so a fetch that
/// started before the push cannot bring back the older state. The marks are
/// dropped once no window is open.
pub(crate) struct Table<V> {
    entries: HashMap<String, Arc<V>>,
    seq: u64,
    open_windows: usize,
    pushed: HashMap<String, u64>,
}

impl<V> Table<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            seq: 0,
            open_windows: 0,
            pushed: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries.values().cloned().collect()
    }

    /// Store a pushed value over whatever is cached.
    pub fn push(&mut self, key: String, value: V) {
        self.mark(&key);
        self.entries.insert(key, Arc::new(value));
    }

    /// Remove on a push. Returns whether the key was cached.
    pub fn push_remove(&mut self, key: &str) -> bool {
        self.mark(key);
        self.entries.remove(key).is_some()
    }

    fn mark(&mut self, key: &str) {
        self.seq += 1;
        if self.open_windows > 0 {
            self.pushed.insert(key.to_string(), self.seq);
        }
    }

    fn pushed_since(&self, key: &str, since: u64) -> bool {
        self.pushed.get(key).is_some_and(|&seq| seq > since)
    }
}

/// Span of one upstream fetch against a [`Table`]. Closes on drop, so a
/// failed or cancelled fetch leaves no marks behind.
pub(crate) struct FetchWindow<'a, V> {
    table: &'a Mutex<Table<V>>,
    since: u64,
}

impl<'a, V> FetchWindow<'a, V> {
    pub fn open(table: &'a Mutex<Table<V>>) -> Self {
        let mut guard = lock(table);
        guard.open_windows += 1;
        let since = guard.seq;
        Self { table, since }
    }

    /// Store a single fetched value unless the key is cached already or was
    /// pushed while the fetch was in flight. Returns the cached value when
    /// there is one, the fetched one otherwise.
    pub fn store(&self, key: &str, value: V) -> Arc<V> {
        let mut table = lock(self.table);
        if let Some(current) = table.entries.get(key) {
            return Arc::clone(current);
        }
        let value = Arc::new(value);
        if !table.pushed_since(key, self.since) {
            table.entries.insert(key.to_string(), Arc::clone(&value));
        }
        value
    }

    /// Make `fetched` the state for every entry `covered` selects. Covered
    /// entries absent from `fetched` are dropped. Keys pushed while the fetch
    /// was in flight keep their pushed state. Returns how many fetched values
    /// were stored.
    pub fn replace(&self, fetched: Vec<(String, V)>, covered: impl Fn(&V) -> bool) -> usize {
        let mut guard = lock(self.table);
        let table = &mut *guard;
        let since = self.since;

        let pushed = &table.pushed;
        table
            .entries
            .retain(|key, value| !covered(value.as_ref()) || pushed.get(key).is_some_and(|&seq| seq > since));

        let mut stored = 0;
        for (key, value) in fetched {
            if table.pushed_since(&key, since) {
                continue;
            }
            table.entries.insert(key, Arc::new(value));
            stored += 1;
        }
        stored
    }
}

impl<V> Drop for FetchWindow<'_, V> {
    fn drop(&mut self) {
        let mut table = lock(self.table);
        table.open_windows = table.open_windows.saturating_sub(1);
        if table.open_windows == 0 {
            table.pushed.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_is_insert_if_absent() {
        let table = Mutex::new(Table::new());
        lock(&table).push("a".into(), 1);

        let window = FetchWindow::open(&table);
        assert_eq!(*window.store("a", 0), 1);
        assert_eq!(*window.store("b", 2), 2);
        drop(window);
        assert_eq!(lock(&table).get("b").as_deref(), Some(&2));
    }

    #[test]
    fn test_removal_during_fetch_is_not_undone() {
        let table = Mutex::new(Table::new());
        let window = FetchWindow::open(&table);
        assert!(!lock(&table).push_remove("a"));

        assert_eq!(*window.store("a", 1), 1);
        assert!(lock(&table).get("a").is_none());
        assert_eq!(window.replace(vec![("a".into(), 1)], |_| true), 0);
        assert!(lock(&table).get("a").is_none());
    }

    #[test]
    fn test_replace_keeps_uncovered_and_pushed_entries() {
        let table = Mutex::new(Table::new());
        {
            let mut t = lock(&table);
            t.push("odd-stale".into(), 1);
            t.push("even-kept".into(), 2);
        }
        let window = FetchWindow::open(&table);
        lock(&table).push("odd-pushed".into(), 3);

        let stored = window.replace(vec![("odd-fresh".into(), 5)], |v| v % 2 == 1);
        assert_eq!(stored, 1);
        let t = lock(&table);
        assert!(t.get("odd-stale").is_none());
        assert_eq!(t.get("even-kept").as_deref(), Some(&2));
        assert_eq!(t.get("odd-pushed").as_deref(), Some(&3));
        assert_eq!(t.get("odd-fresh").as_deref(), Some(&5));
    }

    #[test]
    fn test_marks_cleared_when_last_window_closes() {
        let table = Mutex::new(Table::<i32>::new());
        let first = FetchWindow::open(&table);
        let second = FetchWindow::open(&table);
        lock(&table).push_remove("a");
        drop(first);
        assert_eq!(lock(&table).pushed.len(), 1);
        drop(second);
        assert!(lock(&table).pushed.is_empty());

        // pushes with no window open leave no marks
        lock(&table).push("b".into(), 1);
        assert!(lock(&table).pushed.is_empty());
    }
}
