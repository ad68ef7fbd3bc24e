use std::borrow::Borrow;
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};

use hashlink::LruCache;

use crate::connection::StatementKind;

#[derive(Debug, Clone)]
struct CacheKey {
    kind: StatementKind,
    sql: Box<str>,
}

impl CacheKey {
    fn new(sql: &str, kind: StatementKind) -> Self {
        CacheKey {
            kind,
            sql: sql.into(),
        }
    }
}

/// A view of a cache key, so entries can be looked up by `(kind, &str)` without first
/// copying the statement text into an owned [`CacheKey`].
trait StatementKey {
    fn kind(&self) -> StatementKind;

    fn sql(&self) -> &str;
}

impl StatementKey for CacheKey {
    fn kind(&self) -> StatementKind {
        self.kind
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

impl StatementKey for (StatementKind, &str) {
    fn kind(&self) -> StatementKind {
        self.0
    }

    fn sql(&self) -> &str {
        self.1
    }
}

// `CacheKey` and `dyn StatementKey` must hash identically.
impl Hash for dyn StatementKey + '_ {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.sql().hash(state);
    }
}

impl PartialEq for dyn StatementKey + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.sql() == other.sql()
    }
}

impl Eq for dyn StatementKey + '_ {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self as &dyn StatementKey).hash(state);
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.sql == other.sql
    }
}

impl Eq for CacheKey {}

impl<'a> Borrow<dyn StatementKey + 'a> for CacheKey {
    fn borrow(&self) -> &(dyn StatementKey + 'a) {
        self
    }
}

/// A per-connection LRU cache of prepared statements, keyed by statement text and kind.
///
/// Differs from [`LruCache`] by making the removal process explicit to allow a caller to
/// clean up resources: every entry pushed out of the cache is handed back to the caller.
pub struct StatementCache<T> {
    inner: LruCache<CacheKey, T>,
}

impl<T> Debug for StatementCache<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T> StatementCache<T> {
    /// Create a new cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Returns a reference to the value cached for the statement, marking it as the most
    /// recently used entry.
    pub fn get(&mut self, sql: &str, kind: StatementKind) -> Option<&T> {
        self.inner.get(&(kind, sql) as &dyn StatementKey)
    }

    /// Inserts a new item in the cache, returning the least recently used
    /// value if the cache is full, or if inserting with an existing key,
    /// the replaced existing value.
    pub fn insert(&mut self, sql: &str, kind: StatementKind, value: T) -> Option<T> {
        let borrowed = (kind, sql);
        let lookup: &dyn StatementKey = &borrowed;
        let mut lru_item = None;

        if self.inner.contains_key(lookup) {
            lru_item = self.inner.remove(lookup);
        } else if self.capacity() == self.len() {
            lru_item = self.remove_lru();
        }

        self.inner.insert(CacheKey::new(sql, kind), value);

        lru_item
    }

    /// The number of statements in the cache.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Removes the least recently used item from the cache.
    pub fn remove_lru(&mut self) -> Option<T> {
        self.inner.remove_lru().map(|(_, v)| v)
    }

    /// Removes every entry, least recently used first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.remove_lru())
    }

    /// Returns the maximum number of statements the cache can hold.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Returns true if cache capacity is more than 0.
    pub fn is_enabled(&self) -> bool {
        self.capacity() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used_on_overflow() {
        let mut cache = StatementCache::new(2);

        assert!(cache.insert("SELECT 1", StatementKind::Prepared, 1).is_none());
        assert!(cache.insert("SELECT 2", StatementKind::Prepared, 2).is_none());

        // touch the first entry so the second becomes the oldest
        assert_eq!(cache.get("SELECT 1", StatementKind::Prepared), Some(&1));

        assert_eq!(cache.insert("SELECT 3", StatementKind::Prepared, 3), Some(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("SELECT 2", StatementKind::Prepared).is_none());
    }

    #[test]
    fn kind_is_part_of_the_key() {
        let mut cache = StatementCache::new(4);

        cache.insert("{call audit()}", StatementKind::Prepared, "prepared");
        cache.insert("{call audit()}", StatementKind::Callable, "callable");

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get("{call audit()}", StatementKind::Callable),
            Some(&"callable")
        );
    }

    #[test]
    fn replacing_a_key_returns_the_old_value() {
        let mut cache = StatementCache::new(2);

        cache.insert("SELECT 1", StatementKind::Prepared, 1);
        assert_eq!(cache.insert("SELECT 1", StatementKind::Prepared, 10), Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn drain_empties_oldest_first() {
        let mut cache = StatementCache::new(3);

        cache.insert("a", StatementKind::Plain, 'a');
        cache.insert("b", StatementKind::Plain, 'b');
        cache.insert("c", StatementKind::Plain, 'c');

        assert_eq!(cache.drain().collect::<String>(), "abc");
        assert!(cache.is_empty());
    }

    #[test]
    fn borrowed_keys_hash_like_owned_keys() {
        use std::collections::hash_map::DefaultHasher;

        fn hash_of<K: Hash + ?Sized>(key: &K) -> u64 {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            hasher.finish()
        }

        let owned = CacheKey::new("SELECT * FROM users", StatementKind::Prepared);
        let borrowed = (StatementKind::Prepared, "SELECT * FROM users");
        let other_kind = (StatementKind::Callable, "SELECT * FROM users");

        let owned_view: &dyn StatementKey = owned.borrow();
        let borrowed: &dyn StatementKey = &borrowed;
        let other_kind: &dyn StatementKey = &other_kind;

        assert_eq!(hash_of(&owned), hash_of(borrowed));
        assert_eq!(hash_of(owned_view), hash_of(borrowed));
        assert!(owned_view == borrowed);
        assert!(owned_view != other_kind);
    }

    #[test]
    fn zero_capacity_disables_the_cache() {
        let cache = StatementCache::<()>::new(0);
        assert!(!cache.is_enabled());
    }
}
