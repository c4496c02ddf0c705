//! Lock-striped identity tables.
//!
//! The embedding registry and the member-table cache are read on every
//! script access to a host value and written only when a new host value or
//! type is first seen. Keys are striped over independent `RwLock`s so
//! engines embedding unrelated objects rarely meet on the same lock.

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

const STRIPES: usize = 32;

/// One stripe per cache line pair.
#[repr(align(128))]
struct Stripe<K, V>(RwLock<HashMap<K, V>>);

/// Concurrent map from identity keys to shared entries.
pub struct ShardedMap<K, V> {
    stripes: Box<[Stripe<K, V>]>,
    hasher: RandomState,
}

impl<K, V> fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedMap")
            .field("stripes", &self.stripes.len())
            .finish_non_exhaustive()
    }
}

impl<K: Hash + Eq, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(STRIPES)
    }

    /// `stripes` is rounded up to a power of two between 1 and 256.
    #[must_use]
    pub fn with_shards(stripes: usize) -> Self {
        let count = stripes.clamp(1, 256).next_power_of_two();
        Self {
            stripes: (0..count)
                .map(|_| Stripe(RwLock::new(HashMap::new())))
                .collect(),
            hasher: RandomState::new(),
        }
    }

    fn stripe(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let mask = self.stripes.len() - 1;
        &self.stripes[self.hasher.hash_one(key) as usize & mask].0
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.stripe(key).read().get(key).cloned()
    }

    /// Existing entry for `key`, or the one built by `make`. `make` runs at
    /// most once per key while the stripe is held and must not reenter the
    /// map.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        let stripe = self.stripe(&key).upgradable_read();
        if let Some(existing) = stripe.get(&key) {
            return existing.clone();
        }
        let mut stripe = RwLockUpgradableReadGuard::upgrade(stripe);
        stripe.entry(key).or_insert_with(make).clone()
    }

    /// Remove `key` when its entry still satisfies `pred`.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut stripe = self.stripe(key).write();
        if stripe.get(key).is_some_and(pred) {
            stripe.remove(key)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.0.read().len()).sum()
    }

    /// Take every entry out, leaving the map empty.
    pub fn drain(&self) -> Vec<(K, V)> {
        self.stripes
            .iter()
            .flat_map(|s| std::mem::take(&mut *s.0.write()))
            .collect()
    }
}
