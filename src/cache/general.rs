//! Process-wide object cache
//!
//! Objects are stored under a description string together with the
//! invalidation keys they depend on, their creation time, an optional
//! expiration time and an optional class. Classes bound how many objects of
//! one kind are kept, evicting the least recently used first.

use std::collections::{BTreeSet, HashMap, HashSet};

use lru::LruCache;
use parking_lot::Mutex;

/// A cached object as stored
#[derive(Debug, Clone)]
pub struct CachedObject<V> {
    pub value: V,
    pub keys: Vec<String>,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub class: Option<String>,
}

struct Inner<V> {
    objects: HashMap<String, CachedObject<V>, ahash::RandomState>,
    /// invalidation key -> descriptions depending on it
    by_key: HashMap<String, HashSet<String>, ahash::RandomState>,
    /// class -> descriptions in recency order
    classes: HashMap<String, LruCache<String, ()>, ahash::RandomState>,
    expirations: BTreeSet<(u64, String)>,
}

impl<V> Inner<V> {
    fn remove(&mut self, description: &str) -> Option<CachedObject<V>> {
        let object = self.objects.remove(description)?;
        for key in &object.keys {
            if let Some(dependents) = self.by_key.get_mut(key) {
                dependents.remove(description);
                if dependents.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        if let Some(class) = &object.class {
            if let Some(members) = self.classes.get_mut(class) {
                members.pop(description);
            }
        }
        if let Some(at) = object.expires_at {
            self.expirations.remove(&(at, description.to_string()));
        }
        Some(object)
    }
}

pub struct GeneralCache<V> {
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> GeneralCache<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: HashMap::with_hasher(ahash::RandomState::new()),
                by_key: HashMap::with_hasher(ahash::RandomState::new()),
                classes: HashMap::with_hasher(ahash::RandomState::new()),
                expirations: BTreeSet::new(),
            }),
        }
    }

    /// Look up an object, marking it recently used within its class
    pub fn get(&self, description: &str) -> Option<CachedObject<V>> {
        let mut inner = self.inner.lock();
        let object = inner.objects.get(description)?.clone();
        if let Some(class) = &object.class {
            if let Some(members) = inner.classes.get_mut(class) {
                members.promote(description);
            }
        }
        Some(object)
    }

    /// Store an object, replacing any previous one under the same description
    pub fn insert(&self, description: &str, value: V, keys: Vec<String>, created_at: u64) {
        let mut inner = self.inner.lock();
        inner.remove(description);
        for key in &keys {
            inner
                .by_key
                .entry(key.clone())
                .or_default()
                .insert(description.to_string());
        }
        inner.objects.insert(
            description.to_string(),
            CachedObject {
                value,
                keys,
                created_at,
                expires_at: None,
                class: None,
            },
        );
    }

    /// Set or clear the expiration time of a stored object
    pub fn set_expiration(&self, description: &str, expires_at: Option<u64>) {
        let mut inner = self.inner.lock();
        let Some(object) = inner.objects.get_mut(description) else {
            return;
        };
        let previous = std::mem::replace(&mut object.expires_at, expires_at);
        if let Some(at) = previous {
            inner.expirations.remove(&(at, description.to_string()));
        }
        if let Some(at) = expires_at {
            inner.expirations.insert((at, description.to_string()));
        }
    }

    /// Assign an object to `class`, evicting the oldest members beyond `max_count`
    pub fn set_class(&self, description: &str, class: &str, max_count: Option<usize>) -> usize {
        let mut inner = self.inner.lock();
        let Some(object) = inner.objects.get_mut(description) else {
            return 0;
        };
        let previous = object.class.replace(class.to_string());
        if let Some(previous) = previous {
            if let Some(members) = inner.classes.get_mut(&previous) {
                members.pop(description);
            }
        }
        inner
            .classes
            .entry(class.to_string())
            .or_insert_with(LruCache::unbounded)
            .put(description.to_string(), ());

        let mut evicted = 0;
        if let Some(max_count) = max_count {
            loop {
                let oldest = match inner.classes.get_mut(class) {
                    Some(members) if members.len() > max_count => members.pop_lru(),
                    _ => None,
                };
                let Some((oldest, ())) = oldest else {
                    break;
                };
                inner.remove(&oldest);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn remove(&self, description: &str) -> Option<CachedObject<V>> {
        self.inner.lock().remove(description)
    }

    /// Remove every object depending on any of `keys`, returning how many went
    pub fn invalidate_keys<S: AsRef<str>>(&self, keys: &[S]) -> usize {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        for key in keys {
            let Some(dependents) = inner.by_key.remove(key.as_ref()) else {
                continue;
            };
            for description in dependents {
                if inner.remove(&description).is_some() {
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Remove every object whose expiration time is at or before `now`
    pub fn expire(&self, now: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut expired = 0;
        loop {
            let description = match inner.expirations.first() {
                Some((at, description)) if *at <= now => description.clone(),
                _ => break,
            };
            inner.remove(&description);
            expired += 1;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().objects.is_empty()
    }
}

impl<V: Clone> Default for GeneralCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_invalidation_removes_dependents_only() {
        let cache = GeneralCache::new();
        cache.insert("q1", 1, keys(&["jobs"]), 10);
        cache.insert("q2", 2, keys(&["jobs", "docs"]), 10);
        cache.insert("q3", 3, keys(&["docs"]), 10);

        assert_eq!(cache.invalidate_keys(&["jobs"]), 2);
        assert!(cache.get("q1").is_none());
        assert!(cache.get("q2").is_none());
        assert_eq!(cache.get("q3").map(|o| o.value), Some(3));

        assert_eq!(cache.invalidate_keys(&["jobs"]), 0);
        assert_eq!(cache.invalidate_keys(&["docs"]), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expiration() {
        let cache = GeneralCache::new();
        cache.insert("a", "x", keys(&[]), 0);
        cache.insert("b", "y", keys(&[]), 0);
        cache.set_expiration("a", Some(100));
        cache.set_expiration("b", Some(200));

        assert_eq!(cache.expire(99), 0);
        assert_eq!(cache.expire(100), 1);
        assert!(cache.get("a").is_none());

        cache.set_expiration("b", None);
        assert_eq!(cache.expire(1_000), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_class_limit_evicts_least_recently_used() {
        let cache = GeneralCache::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            cache.insert(name, i, keys(&["k"]), 0);
            assert_eq!(cache.set_class(name, "small", Some(3)), 0);
        }
        // touch "a" so "b" becomes the oldest
        assert!(cache.get("a").is_some());

        cache.insert("d", 3, keys(&["k"]), 0);
        assert_eq!(cache.set_class("d", "small", Some(3)), 1);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.len(), 3);

        // evicted objects no longer show up under their keys
        assert_eq!(cache.invalidate_keys(&["k"]), 3);
    }

    #[test]
    fn test_replace_keeps_indexes_consistent() {
        let cache = GeneralCache::new();
        cache.insert("q", 1, keys(&["old"]), 0);
        cache.set_expiration("q", Some(5));
        cache.insert("q", 2, keys(&["new"]), 1);

        assert_eq!(cache.invalidate_keys(&["old"]), 0);
        assert_eq!(cache.expire(10), 0);
        let object = cache.get("q").unwrap();
        assert_eq!(object.value, 2);
        assert_eq!(object.created_at, 1);
    }
}
