//! Reference-counted derived state
//!
//! Turns "N consumers reference X" into "X is active while N > 0". The
//! first `inc_ref` for a key creates the derived value and reports it
//! activated; the matching last `dec_ref` destroys it and reports it
//! deactivated. Decrementing a key that holds no reference is an
//! invariant violation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use strata_common::model::{PolicyKey, ProfileKey};
use strata_common::{Error, Result};

/// Key type usable in a [`RefCountRegistry`]
pub trait RefKey: Clone + Eq + Hash + Debug {
    /// Blank keys mean "no reference" and are ignored on both paths
    fn is_blank(&self) -> bool {
        false
    }
}

impl RefKey for String {
    fn is_blank(&self) -> bool {
        self.is_empty()
    }
}

impl RefKey for PolicyKey {}
impl RefKey for ProfileKey {}

impl<A: RefKey, B: Clone + Eq + Hash + Debug> RefKey for (A, B) {
    fn is_blank(&self) -> bool {
        self.0.is_blank()
    }
}

/// Receives activation transitions from a registry
pub trait ActivationCallbacks<K, V> {
    /// `key` went from 0 to 1 references
    fn on_activated(&mut self, key: &K, value: &V) -> Result<()>;

    /// `key` went from 1 to 0 references; the value is handed back
    fn on_deactivated(&mut self, key: &K, value: V) -> Result<()>;
}

/// Ignores transitions; the caller inspects the returned flags instead
impl<K, V> ActivationCallbacks<K, V> for () {
    fn on_activated(&mut self, _key: &K, _value: &V) -> Result<()> {
        Ok(())
    }

    fn on_deactivated(&mut self, _key: &K, _value: V) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    count: usize,
}

/// Generic reference-counting registry
#[derive(Debug)]
pub struct RefCountRegistry<K, V> {
    name: &'static str,
    entries: HashMap<K, Entry<V>>,
}

impl<K: RefKey, V> RefCountRegistry<K, V> {
    /// Create an empty registry; `name` identifies it in errors
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
        }
    }

    /// Add a reference to `key`, creating and activating it on 0 -> 1
    ///
    /// Returns true when the key was activated by this call.
    pub fn inc_ref<C>(
        &mut self,
        key: &K,
        create: impl FnOnce(&K) -> Result<V>,
        callbacks: &mut C,
    ) -> Result<bool>
    where
        C: ActivationCallbacks<K, V> + ?Sized,
    {
        if key.is_blank() {
            return Ok(false);
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.count += 1;
            return Ok(false);
        }
        let value = create(key)?;
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert(Entry { value, count: 1 });
        callbacks.on_activated(key, &entry.value)?;
        Ok(true)
    }

    /// Drop a reference to `key`, deactivating it on 1 -> 0
    ///
    /// Returns true when the key was deactivated by this call.
    pub fn dec_ref<C>(&mut self, key: &K, callbacks: &mut C) -> Result<bool>
    where
        C: ActivationCallbacks<K, V> + ?Sized,
    {
        if key.is_blank() {
            return Ok(false);
        }
        let Some(entry) = self.entries.get_mut(key) else {
            return Err(Error::underflow(self.name, key));
        };
        entry.count -= 1;
        if entry.count > 0 {
            return Ok(false);
        }
        let Some(entry) = self.entries.remove(key) else {
            return Err(Error::underflow(self.name, key));
        };
        callbacks.on_deactivated(key, entry.value)?;
        Ok(true)
    }

    /// Current reference count (0 when absent)
    pub fn count(&self, key: &K) -> usize {
        self.entries.get(key).map_or(0, |e| e.count)
    }

    /// Whether `key` is active
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Derived value of an active key
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Number of active keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is active
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Active keys with their values
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, e)| (k, &e.value))
    }
}
