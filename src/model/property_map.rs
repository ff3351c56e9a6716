//! PropertyStore: the ordered key-value dictionary on every object.

use indexmap::IndexMap;

use super::{Key, Value};

/// One property change as it travels to peers. `None` removes the key.
pub type Change = (Key, Option<Value>);

/// Published entries plus locally staged edits, both in insertion order.
///
/// Reads see staged edits first. Staged edits (including staged removals)
/// stay local until `take_staged` folds them into the published map and
/// hands them out for synchronization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyStore {
    published: IndexMap<Key, Value>,
    staged: IndexMap<Key, Option<Value>>,
}

impl PropertyStore {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, key: impl Into<Key>) -> Option<&Value> {
        let key = key.into();
        match self.staged.get(&key) {
            Some(staged) => staged.as_ref(),
            None => self.published.get(&key),
        }
    }

    /// Write a value. Unpublished writes are visible to `get` but wait for
    /// `take_staged`. Returns true when the visible value changed.
    pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>, publish: bool) -> bool {
        let key = key.into();
        let value = value.into();
        let changed = self.get(&key) != Some(&value);
        if publish {
            self.staged.shift_remove(&key);
            self.published.insert(key, value);
        } else {
            self.staged.insert(key, Some(value));
        }
        changed
    }

    /// Remove a key. Returns true if it was present.
    pub fn remove(&mut self, key: impl Into<Key>, publish: bool) -> bool {
        let key = key.into();
        let present = self.get(&key).is_some();
        if publish {
            self.staged.shift_remove(&key);
            self.published.shift_remove(&key);
        } else if present || self.published.contains_key(&key) {
            self.staged.insert(key, None);
        }
        present
    }

    pub fn contains_key(&self, key: impl Into<Key>) -> bool {
        self.get(key).is_some()
    }

    pub fn contains_value(&self, value: &Value) -> bool {
        self.iter().any(|(_, v)| v == value)
    }

    pub fn len(&self) -> usize { self.iter().count() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Visible entries: published order first, then keys that exist only as
    /// staged additions.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> + '_ {
        let published = self.published.iter().filter_map(|(k, v)| match self.staged.get(k) {
            Some(staged) => staged.as_ref().map(|s| (k, s)),
            None => Some((k, v)),
        });
        let added = self
            .staged
            .iter()
            .filter(|(k, _)| !self.published.contains_key(*k))
            .filter_map(|(k, v)| v.as_ref().map(|v| (k, v)));
        published.chain(added)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn has_staged(&self) -> bool { !self.staged.is_empty() }

    /// Fold staged edits into the published map and return them.
    pub fn take_staged(&mut self) -> Vec<Change> {
        let changes: Vec<Change> = self.staged.drain(..).collect();
        for (key, value) in &changes {
            match value {
                Some(v) => { self.published.insert(key.clone(), v.clone()); }
                None => { self.published.shift_remove(key); }
            }
        }
        changes
    }

    /// Discard staged edits without publishing them.
    pub fn clear_staged(&mut self) { self.staged.clear(); }

    /// Apply changes that arrived from a peer. Staged local edits for the same
    /// key keep shadowing the new published value. Returns true if anything
    /// in the published map changed.
    pub fn apply_remote(&mut self, changes: &[Change]) -> bool {
        let mut changed = false;
        for (key, value) in changes {
            match value {
                Some(v) => {
                    if self.published.get(key) != Some(v) {
                        self.published.insert(key.clone(), v.clone());
                        changed = true;
                    }
                }
                None => changed |= self.published.shift_remove(key).is_some(),
            }
        }
        changed
    }

    /// Published entries only, as sent to peers on announcement.
    pub fn published(&self) -> impl Iterator<Item = (&Key, &Value)> + '_ {
        self.published.iter()
    }
}

impl<K: Into<Key>, V: Into<Value>> FromIterator<(K, V)> for PropertyStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            published: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            staged: IndexMap::new(),
        }
    }
}
