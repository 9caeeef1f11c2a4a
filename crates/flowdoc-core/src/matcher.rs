//! Cache matchers.
//!
//! A matcher is a membership predicate for one cached query: given an
//! entity's document, would the entity belong to the query's result? The
//! session uses matchers to decide which cached results a change can affect
//! and to merge unflushed entities into query results.

use crate::document::{Document, Entity, Intent, Value};

/// A tracked change, as seen by the query cache.
#[derive(Debug, Clone, Copy)]
pub struct ChangeEvent<'a> {
    /// Logical collection of the changed entity.
    pub collection: &'a str,
    /// The entity in its current state.
    pub entity: &'a Entity,
    /// Document as loaded from the store, if the entity was loaded.
    pub previous: Option<&'a Document>,
    /// Intent recorded for this change.
    pub intent: Intent,
}

/// Membership predicate for a cached query result.
pub trait CacheMatcher: Send + Sync {
    /// Does an entity with this document belong to the query's result?
    ///
    /// The document is the full stored form, `_id` included.
    fn matches(&self, document: &Document) -> bool;

    /// Can the change affect a cached result of this query?
    ///
    /// True if the entity matches now, or matched before the change.
    fn invalidates(&self, change: &ChangeEvent<'_>) -> bool {
        self.matches(&change.entity.to_document())
            || change.previous.is_some_and(|prev| self.matches(prev))
    }
}

impl<F> CacheMatcher for F
where
    F: Fn(&Document) -> bool + Send + Sync,
{
    fn matches(&self, document: &Document) -> bool {
        self(document)
    }
}

/// Matches documents whose `field` equals `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEquals {
    field: String,
    value: Value,
}

impl FieldEquals {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl CacheMatcher for FieldEquals {
    fn matches(&self, document: &Document) -> bool {
        document.get(&self.field) == Some(&self.value)
    }
}
