//! Document store trait.
//!
//! [`DocumentStore`] is the only contract the session layer needs from a
//! backing store: a point read, a filtered query, an insert, a partial update
//! by id and a delete by id. Nothing else is assumed; in particular there are
//! no multi-document transactions.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use crate::document::{Document, EntityId};
use crate::filter::Filter;
use asupersync::{Cx, Outcome};

/// A schemaless, non-transactional document store.
///
/// Collection names passed to a store are store-side names, i.e. after any
/// configured prefix has been applied.
///
/// # Example
///
/// ```rust,ignore
/// let doc = store.find_by_id(&cx, "variables", &EntityId::new("v1")).await;
/// store.update_by_id(&cx, "variables", &id, changes).await;
/// ```
pub trait DocumentStore: Send + Sync {
    /// Fetch one document by id.
    fn find_by_id(
        &self,
        cx: &Cx,
        collection: &str,
        id: &EntityId,
    ) -> impl Future<Output = Outcome<Option<Document>, crate::Error>> + Send;

    /// Fetch every document matching the filter.
    fn find(
        &self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<Vec<Document>, crate::Error>> + Send;

    /// Insert a full document. The document carries its id in `_id`.
    fn insert_one(
        &self,
        cx: &Cx,
        collection: &str,
        document: Document,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Overwrite the given fields of one document (`$set` semantics).
    ///
    /// A `null` value unsets the field.
    fn update_by_id(
        &self,
        cx: &Cx,
        collection: &str,
        id: &EntityId,
        changes: Document,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Delete one document by id. Deleting a missing document is not an error.
    fn delete_by_id(
        &self,
        cx: &Cx,
        collection: &str,
        id: &EntityId,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}
