//! Entity managers: per-collection (de)serialization.
//!
//! The session never knows how a particular entity type maps onto a stored
//! document. It asks the [`EntityManager`] registered for the collection.

use crate::document::{Document, Entity, EntityId, ID_FIELD, Value};
use crate::error::{Error, Result};

/// Maps entities of one collection to and from stored documents.
pub trait EntityManager: Send + Sync {
    /// Logical collection this manager is responsible for.
    fn collection(&self) -> &str;

    /// Full document for an insert. Must carry the id in `_id`.
    fn serialize(&self, entity: &Entity) -> Result<Document>;

    /// Partial document for an update.
    ///
    /// `changes` is the accumulated set of changed fields since load. The
    /// default writes exactly those fields; managers may narrow or widen the
    /// payload, but must never include `_id`.
    fn serialize_update(&self, entity: &Entity, changes: &Document) -> Result<Document> {
        let _ = entity;
        let mut doc = changes.clone();
        doc.remove(ID_FIELD);
        Ok(doc)
    }

    /// Rebuild an entity from a stored document.
    fn deserialize(&self, document: Document) -> Result<Entity>;
}

/// Extract the entity id from a stored document.
///
/// String ids are taken verbatim; other scalar ids are rendered as JSON text.
pub fn document_id(document: &Document) -> Result<EntityId> {
    match document.get(ID_FIELD) {
        Some(Value::String(s)) => Ok(EntityId::new(s.clone())),
        Some(Value::Null) | None => Err(Error::Serde(format!(
            "document has no '{}' field",
            ID_FIELD
        ))),
        Some(other) => Ok(EntityId::new(other.to_string())),
    }
}

/// Pass-through manager: fields are stored as-is, `_id` carries the id.
#[derive(Debug, Clone)]
pub struct DocumentManager {
    collection: String,
}

impl DocumentManager {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }
}

impl EntityManager for DocumentManager {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn serialize(&self, entity: &Entity) -> Result<Document> {
        Ok(entity.to_document())
    }

    fn deserialize(&self, document: Document) -> Result<Entity> {
        let id = document_id(&document)?;
        tracing::trace!(collection = %self.collection, id = %id, "Deserializing document");
        Ok(Entity::from_fields(self.collection.clone(), id, document))
    }
}
