use std::collections::{BTreeMap, BTreeSet};

/// A staged set of updates, applied atomically by
/// [`Collection::update`](crate::Collection::update).
///
/// Keys and values are arbitrary byte strings ordered lexicographically.
/// A key never appears in both maps: the later of `set` and `delete` on
/// the same key wins.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub(crate) sets: BTreeMap<Vec<u8>, Vec<u8>>,
    pub(crate) deletes: BTreeSet<Vec<u8>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    /// Stages `key -> value`, overriding any earlier `delete` of the key.
    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        self.deletes.remove(&key);
        self.sets.insert(key, value.into());
    }

    /// Stages a delete, overriding any earlier `set` of the key.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        let key = key.into();
        self.sets.remove(&key);
        self.deletes.insert(key);
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.deletes.is_empty()
    }

    /// The union of set and delete keys in ascending order.
    pub(crate) fn merged_keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self.sets.keys().cloned().collect();
        keys.extend(self.deletes.iter().cloned());
        keys.sort();
        keys
    }
}
