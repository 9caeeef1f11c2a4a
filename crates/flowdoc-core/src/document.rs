//! Entities, ids and documents.
//!
//! An [`Entity`] is the in-memory form of one stored document: a logical
//! collection name, a stable [`EntityId`] and a mutable field set. Within a
//! session entities are shared as [`EntityRef`] so that every collaborator
//! holding the same id sees the same object.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use serde_json::Value;

/// A schemaless document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// Name of the document field that carries the entity id in the store.
pub const ID_FIELD: &str = "_id";

/// Stable identifier of an entity within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a strong, time-ordered identifier (UUID v7).
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the id and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Tracked intent of an entity within a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Intent {
    /// Created in this session, written with an insert on flush.
    Inserted,
    /// Existing record with changed fields, written with a partial update.
    Updated,
    /// Existing record removed, written with a delete.
    Deleted,
    /// Not tracked, or collapsed (inserted and deleted in the same session).
    #[default]
    None,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intent::Inserted => "insert",
            Intent::Updated => "update",
            Intent::Deleted => "delete",
            Intent::None => "none",
        };
        f.write_str(s)
    }
}

/// A domain record with an id, a collection and a mutable field set.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    collection: String,
    id: EntityId,
    fields: Document,
}

impl Entity {
    /// Create an entity with no fields.
    pub fn new(collection: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            fields: Document::new(),
        }
    }

    /// Create an entity with a freshly generated id.
    pub fn with_generated_id(collection: impl Into<String>) -> Self {
        Self::new(collection, EntityId::generate())
    }

    /// Create an entity from an existing field set.
    ///
    /// An `_id` entry in `fields` is dropped; the id lives outside the fields.
    pub fn from_fields(
        collection: impl Into<String>,
        id: impl Into<EntityId>,
        mut fields: Document,
    ) -> Self {
        fields.remove(ID_FIELD);
        Self {
            collection: collection.into(),
            id: id.into(),
            fields,
        }
    }

    /// Set a field (builder pattern).
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn fields(&self) -> &Document {
        &self.fields
    }

    /// Get a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a field value as a string slice, if it is a JSON string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Remove a field, returning the previous value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Apply a change set: every entry overwrites the field of the same name.
    pub fn apply(&mut self, changes: &Document) {
        for (name, value) in changes {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Full document representation, including `_id`.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), Value::String(self.id.to_string()));
        for (name, value) in &self.fields {
            doc.insert(name.clone(), value.clone());
        }
        doc
    }

    /// Wrap into a shareable reference.
    pub fn into_ref(self) -> EntityRef {
        Arc::new(RwLock::new(self))
    }
}

/// Shared reference to a session-tracked entity.
pub type EntityRef = Arc<RwLock<Entity>>;

/// Read an entity, recovering the guard if a writer panicked.
///
/// Entities hold plain data, so a poisoned lock still guards a usable value.
pub fn read_entity(entity: &EntityRef) -> RwLockReadGuard<'_, Entity> {
    entity.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock an entity, recovering the guard if a writer panicked.
pub fn write_entity(entity: &EntityRef) -> RwLockWriteGuard<'_, Entity> {
    entity.write().unwrap_or_else(PoisonError::into_inner)
}
