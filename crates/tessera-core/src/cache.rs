//! Time-boxed LRU cache
//!
//! Entries expire a fixed time after they were written (or, optionally, after
//! they were last read). Expired entries are dropped lazily on access or in
//! bulk by [`TtlCache::purge_expired`]. Time comes from `tokio::time`, so tests
//! can drive expiry with a paused clock.

use lru::LruCache;
use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// LRU cache whose entries expire after a time-to-live
pub struct TtlCache<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
    ttl: Duration,
    update_age_on_get: bool,
}

impl<K: Hash + Eq, V> TtlCache<K, V> {
    /// Unbounded cache
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: LruCache::unbounded(),
            ttl,
            update_age_on_get: false,
        }
    }

    /// Cache holding at most `capacity` entries, evicting the least recently
    /// used on overflow
    pub fn with_capacity(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
            update_age_on_get: false,
        }
    }

    /// Restart an entry's time-to-live whenever it is read
    pub fn update_age_on_get(mut self, enabled: bool) -> Self {
        self.update_age_on_get = enabled;
        self
    }

    /// Time-to-live of new entries
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace, returning the previous live value
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: now + self.ttl,
        };
        self.entries
            .put(key, entry)
            .filter(|old| old.expires_at > now)
            .map(|old| old.value)
    }

    /// Live value for `key`
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let expired = match self.entries.peek(key) {
            None => return None,
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            self.entries.pop(key);
            return None;
        }

        let ttl = self.ttl;
        let refresh = self.update_age_on_get;
        let entry = self.entries.get_mut(key)?;
        if refresh {
            entry.expires_at = now + ttl;
        }
        Some(&entry.value)
    }

    /// Live value for `key`, mutable
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let expired = match self.entries.peek(key) {
            None => return None,
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.get_mut(key).map(|entry| &mut entry.value)
    }

    /// Key has a live value
    pub fn contains<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        match self.entries.peek(key) {
            Some(entry) if entry.expires_at > now => true,
            Some(_) => {
                self.entries.pop(key);
                false
            }
            None => false,
        }
    }

    /// Remove, returning the live value if there was one
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .pop(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value)
    }

    /// Number of stored entries, expired ones included until purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No stored entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Hash + Eq + Clone, V> TtlCache<K, V> {
    /// Drop every expired entry, returning how many were dropped
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key)
            .cloned()
            .collect();
        let count = expired.len();
        for key in expired {
            self.entries.pop(&key);
        }
        count
    }
}
