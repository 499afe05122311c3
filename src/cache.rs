//! Time-bounded DEK cache.
//!
//! Maps `(ring, key id)` to an unwrapped DEK so hot paths skip the object
//! store and the KEK unwrap. Entries follow a stale-while-revalidate shape:
//!
//! ```text
//!  inserted        fresh            stale
//!     |── served ────|── served, ─────|── evicted
//!                       one caller
//!                       revalidates
//! ```
//!
//! The cache is a pure optimisation: every caller must behave correctly if
//! it is empty, disabled (`max_size == 0`) or cleared at any moment.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::keys::DataEncryptionKey;

/// Cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which an entry is still served but due for refresh.
    #[serde(rename = "fresh_ms", with = "duration_ms")]
    pub fresh: Duration,
    /// Age after which an entry is evicted outright.
    #[serde(rename = "stale_ms", with = "duration_ms")]
    pub stale: Duration,
    /// Maximum number of entries. Zero disables caching.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh: Duration::from_secs(10),
            stale: Duration::from_secs(60),
            max_size: 1_000_000,
        }
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Outcome of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHit {
    /// A value is cached.
    Hit,
    /// Nothing is cached.
    Miss,
    /// The key is cached as known-absent.
    Null,
}

/// Result of [`Cache::get`].
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    pub value: Option<V>,
    pub hit: CacheHit,
    /// Set for exactly one lookup of an entry that has passed its fresh
    /// window. That caller is responsible for refreshing it.
    pub revalidate: bool,
}

struct Entry<V> {
    value: Option<V>,
    inserted: Instant,
    seq: u64,
    revalidating: bool,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Insertion sequence -> key, oldest first.
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: Hash + Eq + Clone, V> Inner<K, V> {
    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

/// A capacity-bounded, thread-safe stale-while-revalidate cache.
pub struct Cache<K, V> {
    inner: Mutex<Inner<K, V>>,
    config: CacheConfig,
}

/// The cache the vault keeps unwrapped DEKs in.
pub type DekCache = Cache<String, Arc<DataEncryptionKey>>;

/// Cache key for a DEK (or the `LATEST` alias) within a ring.
pub fn dek_cache_key(ring_id: &str, key_id: &str) -> String {
    format!("{ring_id}/{key_id}")
}

impl<K: Hash + Eq + Clone, V: Clone> Cache<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            config,
        }
    }

    pub fn get(&self, key: &K) -> Lookup<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Lookup<V> {
        let mut inner = self.inner.lock();

        let age = match inner.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.inserted),
            None => return Lookup::miss(),
        };
        if age >= self.config.stale {
            inner.remove(key);
            return Lookup::miss();
        }

        let fresh = self.config.fresh;
        let Some(entry) = inner.entries.get_mut(key) else {
            return Lookup::miss();
        };
        match &entry.value {
            None => Lookup {
                value: None,
                hit: CacheHit::Null,
                revalidate: false,
            },
            Some(value) => {
                let revalidate = age >= fresh && !entry.revalidating;
                if revalidate {
                    entry.revalidating = true;
                }
                Lookup {
                    value: Some(value.clone()),
                    hit: CacheHit::Hit,
                    revalidate,
                }
            }
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.insert_at(key, Some(value), Instant::now());
    }

    /// Cache `key` as known-absent.
    pub fn set_null(&self, key: K) {
        self.insert_at(key, None, Instant::now());
    }

    fn insert_at(&self, key: K, value: Option<V>, now: Instant) {
        if self.config.max_size == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.remove(&key);

        while inner.entries.len() >= self.config.max_size {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted: now,
                seq,
                revalidating: false,
            },
        );
    }

    pub fn remove(&self, key: &K) {
        self.inner.lock().remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Lookup<V> {
    fn miss() -> Self {
        Self {
            value: None,
            hit: CacheHit::Miss,
            revalidate: false,
        }
    }
}
