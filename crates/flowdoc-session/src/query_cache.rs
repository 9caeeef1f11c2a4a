//! Query result cache.
//!
//! Caches the result of a parameterized query under a caller-chosen key.
//! Every entry carries the matcher of the query that produced it. When a
//! tracked change occurs, entries of the changed collection whose matcher
//! accepts the entity (before or after the change) are dropped; a stale
//! result is never served.
//!
//! Queries without a matcher are never cached, since there would be no way
//! to tell which changes affect them.

use flowdoc_core::{CacheMatcher, ChangeEvent, EntityRef};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct CachedQuery {
    key: String,
    result: Vec<EntityRef>,
    matcher: Arc<dyn CacheMatcher>,
}

impl fmt::Debug for CachedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedQuery")
            .field("key", &self.key)
            .field("result", &self.result.len())
            .finish_non_exhaustive()
    }
}

/// Per-session cache of query results.
#[derive(Debug, Default)]
pub struct QueryCache {
    /// Entries by logical collection.
    entries: HashMap<String, Vec<CachedQuery>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for `(collection, key)`, if still valid.
    pub fn lookup(&self, collection: &str, key: &str) -> Option<Vec<EntityRef>> {
        let entry = self
            .entries
            .get(collection)?
            .iter()
            .find(|entry| entry.key == key)?;
        Some(entry.result.iter().map(Arc::clone).collect())
    }

    /// Cache a query result.
    ///
    /// Returns `false` (and caches nothing) when no matcher is supplied. An
    /// existing entry with the same key is replaced.
    #[tracing::instrument(level = "debug", skip(self, result, matcher))]
    pub fn store(
        &mut self,
        collection: &str,
        key: &str,
        result: &[EntityRef],
        matcher: Option<Arc<dyn CacheMatcher>>,
    ) -> bool {
        let Some(matcher) = matcher else {
            tracing::debug!("No matcher - result not cached");
            return false;
        };
        let bucket = self.entries.entry(collection.to_string()).or_default();
        bucket.retain(|entry| entry.key != key);
        bucket.push(CachedQuery {
            key: key.to_string(),
            result: result.iter().map(Arc::clone).collect(),
            matcher,
        });
        tracing::debug!(size = result.len(), "Cached query result");
        true
    }

    /// Drop every entry the change could affect.
    ///
    /// Returns the number of entries dropped.
    pub fn invalidate_for_change(&mut self, change: &ChangeEvent<'_>) -> usize {
        let Some(bucket) = self.entries.get_mut(change.collection) else {
            return 0;
        };
        let before = bucket.len();
        bucket.retain(|entry| {
            let hit = entry.matcher.invalidates(change);
            if hit {
                tracing::debug!(
                    collection = change.collection,
                    key = %entry.key,
                    entity = %change.entity.id(),
                    intent = %change.intent,
                    "Invalidating cached query"
                );
            }
            !hit
        });
        before - bucket.len()
    }

    /// Number of cached queries.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
