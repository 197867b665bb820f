//! Data structures for passing keys into a batched fetch and values back out
//! of it.

use std::collections::HashMap;
use std::convert::Infallible;
use std::hash::Hash;
use std::mem;

use indexmap::map::{Entry, IndexMap};

/// The set of keys handed to [`Source::fetch_batch`](crate::Source::fetch_batch).
/// Use [`keys`](KeySet::keys) to build your lookup, then one of the
/// `*_values` methods to turn the response into a [`ValueSet`] that is handed
/// back to the loader.
///
/// Keys are unique and are yielded in the order they were first requested.
#[derive(Debug, Clone)]
pub struct KeySet<Key: Eq + Hash> {
    // Each key is associated with the number of requesters *past the first*
    // that are waiting on it. A requester that loses interest before the
    // batch is dispatched decrements this count; when it would go below zero
    // the key leaves the set entirely, so the fetch never sees keys nobody
    // wants.
    keys: IndexMap<Key, usize>,
}

impl<Key: Eq + Hash> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: IndexMap::new(),
        }
    }

    /// Register one requester for `key`. Returns true if the key was not
    /// already in the set.
    pub(crate) fn add_key(&mut self, key: Key) -> bool {
        match self.keys.entry(key) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() += 1;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(0);
                true
            }
        }
    }

    /// Drop one requester of `key`. Returns true if that was the last
    /// requester and the key left the set.
    pub(crate) fn discard_key(&mut self, key: &Key) -> bool {
        match self.keys.get_mut(key) {
            Some(0) => {
                self.keys.shift_remove(key);
                true
            }
            Some(count) => {
                *count -= 1;
                false
            }
            None => panic!("Attempted to remove nonexistent key from KeySet"),
        }
    }

    /// Take the keys out of this set, leaving it empty. Used when a batch
    /// stops accumulating and is handed to its source.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            keys: mem::take(&mut self.keys),
        }
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn contains(&self, key: &Key) -> bool {
        self.keys.contains_key(key)
    }

    /// Iterate over the unique keys, in first-request order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> + Clone {
        self.keys.keys()
    }

    pub fn to_vec(&self) -> Vec<Key>
    where
        Key: Clone,
    {
        self.keys().cloned().collect()
    }

    /// Pair every key with a value computed from it. This (and the other
    /// `*_values` methods) is the only way to create a ValueSet, which
    /// guarantees that the result has exactly one entry per key.
    pub fn into_values<Value>(self, mut get_value: impl FnMut(&Key) -> Value) -> ValueSet<Key, Value> {
        match self.try_into_values(move |key| -> Result<Value, Infallible> { Ok(get_value(key)) }) {
            Ok(values) => values,
            Err(never) => match never {},
        }
    }

    /// Fallible version of into_values. Returns the first error produced by
    /// `get_value`.
    pub fn try_into_values<Value, Error>(
        self,
        mut get_value: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> Result<ValueSet<Key, Value>, Error> {
        let values = self
            .keys
            .into_iter()
            .map(move |(key, _count)| {
                let value = get_value(&key)?;
                Ok((key, value))
            })
            .collect::<Result<HashMap<Key, Value>, Error>>()?;

        Ok(ValueSet { values })
    }

    /// Build a ValueSet from rows that were found for (some of) the keys.
    /// Keys with no row map to `None`; rows for keys outside this set are
    /// ignored. If a key has several rows, the last one wins.
    pub fn lookup_values<Value>(
        self,
        found: impl IntoIterator<Item = (Key, Value)>,
    ) -> ValueSet<Key, Option<Value>> {
        let mut found: HashMap<Key, Value> = found.into_iter().collect();
        self.into_values(move |key| found.remove(key))
    }

    /// Build a ValueSet by grouping rows under their key. Row order within a
    /// group is preserved, and keys with no rows map to an empty list.
    pub fn group_values<Value>(
        self,
        rows: impl IntoIterator<Item = (Key, Value)>,
    ) -> ValueSet<Key, Vec<Value>> {
        let mut groups: HashMap<Key, Vec<Value>> = HashMap::new();
        for (key, value) in rows {
            if self.contains(&key) {
                groups.entry(key).or_default().push(value);
            }
        }

        self.into_values(move |key| groups.remove(key).unwrap_or_default())
    }
}

/// The result of one batched fetch: exactly one value for each key of the
/// [`KeySet`] it was created from. The loader uses it to populate the request
/// cache, from which every waiting placeholder takes its value.
#[derive(Debug)]
pub struct ValueSet<Key: Eq + Hash, Value> {
    values: HashMap<Key, Value>,
}

impl<Key: Eq + Hash, Value> ValueSet<Key, Value> {
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.values.get(key)
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (Key, Value)> {
        self.values.into_iter()
    }
}
