//! Identity Map for tracking unique entity instances per `(collection, id)`.
//!
//! The Identity Map ensures that each stored document corresponds to exactly
//! one entity instance within a session. This provides:
//!
//! - **Uniqueness**: Same id always returns the same reference
//! - **Cache**: Avoids redundant point reads for the same entity
//! - **Consistency**: Changes to an entity are visible everywhere it's used
//!
//! # Design
//!
//! Entries are `Arc<RwLock<Entity>>`. When you get an entity twice with the
//! same key, you get the same `Arc` back, so pointer equality is the identity
//! test. Insertion order per collection is kept so that query merging and
//! diagnostics are deterministic.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let first = map.insert(entity);
//! let second = map.get(&EntityKey::new("variables", "v1")).unwrap();
//! assert!(Arc::ptr_eq(&first, &second));
//! ```

use flowdoc_core::{Entity, EntityId, EntityRef, read_entity};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identity of an entity within a session: logical collection plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub collection: String,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(collection: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Key of an entity.
    pub fn of(entity: &Entity) -> Self {
        Self::new(entity.collection(), entity.id().clone())
    }

    /// Key of a shared entity reference.
    pub fn of_ref(entity: &EntityRef) -> Self {
        Self::of(&read_entity(entity))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Identity Map for tracking unique entity instances.
///
/// There is no eviction; the map lives exactly as long as its session.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityRef>,
    /// Keys in insertion order.
    order: Vec<EntityKey>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an entity by key.
    ///
    /// The returned `Arc` is a clone of the stored one, so modifications are shared.
    pub fn get(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.get(key).map(Arc::clone)
    }

    /// Register a shared reference.
    ///
    /// If an entity with the same key already exists, the existing reference
    /// is returned and `entity` is ignored.
    pub fn put(&mut self, entity: EntityRef) -> EntityRef {
        let key = EntityKey::of_ref(&entity);
        if let Some(existing) = self.entries.get(&key) {
            return Arc::clone(existing);
        }
        self.order.push(key.clone());
        self.entries.insert(key, Arc::clone(&entity));
        entity
    }

    /// Wrap and register an entity. Existing references win.
    pub fn insert(&mut self, entity: Entity) -> EntityRef {
        let key = EntityKey::of(&entity);
        if let Some(existing) = self.entries.get(&key) {
            return Arc::clone(existing);
        }
        let entity = entity.into_ref();
        self.order.push(key.clone());
        self.entries.insert(key, Arc::clone(&entity));
        entity
    }

    /// Remove an entity from the map.
    ///
    /// # Returns
    ///
    /// The removed reference, or `None` if it wasn't in the map.
    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityRef> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    /// All entities of a collection, in insertion order.
    pub fn all(&self, collection: &str) -> Vec<EntityRef> {
        self.order
            .iter()
            .filter(|key| key.collection == collection)
            .filter_map(|key| self.entries.get(key).map(Arc::clone))
            .collect()
    }

    /// Is this exact reference the one tracked for its key?
    pub fn is_tracked(&self, entity: &EntityRef) -> bool {
        let key = EntityKey::of_ref(entity);
        self.entries
            .get(&key)
            .is_some_and(|tracked| Arc::ptr_eq(tracked, entity))
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
