//! TTL response cache keyed by structured cache keys.
//!
//! Entries are valid while `now - stored_at < ttl`. Expired entries are never
//! returned and are evicted by [`ResponseCache::sweep`]. The caller supplies
//! `now` so the cache itself holds no clock.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Default entry lifetime: five minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// The REST resources the client knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// `/tasks`
    Tasks,
    /// `/projects`
    Projects,
    /// `/tags`
    Tags,
}

impl ResourceKind {
    /// Collection path, e.g. `/tasks`.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Tasks => "/tasks",
            Self::Projects => "/projects",
            Self::Tags => "/tags",
        }
    }

    /// Lower-case singular noun used in messages.
    #[must_use]
    pub const fn singular(self) -> &'static str {
        match self {
            Self::Tasks => "task",
            Self::Projects => "project",
            Self::Tags => "tag",
        }
    }

    /// Lower-case plural noun used in messages.
    #[must_use]
    pub const fn plural(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Projects => "projects",
            Self::Tags => "tags",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

/// Identifies a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The full collection of a resource.
    Collection(ResourceKind),
    /// One item of a resource by id.
    Item(ResourceKind, String),
}

impl CacheKey {
    /// The resource this key belongs to.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Collection(kind) | Self::Item(kind, _) => *kind,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection(kind) => write!(f, "{}", kind.path()),
            Self::Item(kind, id) => write!(f, "{}/{id}", kind.path()),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Map from [`CacheKey`] to a value with its storage time.
#[derive(Debug, Clone)]
pub struct ResponseCache<V> {
    ttl: Duration,
    entries: HashMap<CacheKey, CacheEntry<V>>,
}

impl<V> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<V> ResponseCache<V> {
    /// Creates an empty cache with the given entry lifetime.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, stored_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(stored_at) < self.ttl
    }

    /// Returns the value for `key` if it is still valid at `now`.
    #[must_use]
    pub fn get(&self, key: &CacheKey, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|entry| self.is_fresh(entry.stored_at, now))
            .map(|entry| &entry.value)
    }

    /// Stores `value` under `key`, stamped with `now`. Returns the value it
    /// replaced, valid or not.
    pub fn insert(&mut self, key: CacheKey, value: V, now: Instant) -> Option<V> {
        self.entries
            .insert(
                key,
                CacheEntry {
                    value,
                    stored_at: now,
                },
            )
            .map(|old| old.value)
    }

    /// Removes the entry for `key`.
    pub fn remove(&mut self, key: &CacheKey) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Removes every entry belonging to `kind`.
    pub fn remove_kind(&mut self, kind: ResourceKind) {
        self.entries.retain(|key, _| key.kind() != kind);
    }

    /// Evicts every entry that has expired at `now`. Returns how many were
    /// removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) < ttl);
        before - self.entries.len()
    }

    /// Whether an entry exists for `key`, expired or not.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
