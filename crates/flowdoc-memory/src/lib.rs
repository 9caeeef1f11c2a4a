//! In-memory document store for flowdoc.
//!
//! `MemoryStore` implements [`DocumentStore`] over plain maps. It is the
//! store used by the test suites and by callers that want an embedded,
//! process-local store. Besides the five store operations it offers:
//!
//! - **Seeding**: put documents in place without going through the write log
//! - **Write log**: every successful write, in the order it was applied
//! - **Read counter**: number of point reads and queries served
//! - **Failure injection**: make a specific write, or every call, fail
//!
//! Updates follow `$set` semantics, with a `null` value unsetting the field.
//!
//! Clones share state, so a test can keep one handle for inspection while
//! the registry owns another.

use flowdoc_core::{
    Cx, Document, DocumentStore, EntityId, Error, Filter, ID_FIELD, Outcome, StoreErrorKind,
    Value,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Kind of write recorded in the write log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WriteOp::Insert => "insert",
            WriteOp::Update => "update",
            WriteOp::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// One applied write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    pub op: WriteOp,
    /// Store-side collection name.
    pub collection: String,
    pub id: EntityId,
}

impl fmt::Display for WriteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.op, self.collection, self.id)
    }
}

#[derive(Debug, Default)]
struct State {
    /// Documents per collection, in insertion order.
    collections: HashMap<String, Vec<Document>>,
    log: Vec<WriteEntry>,
    reads: usize,
    failures: HashMap<(WriteOp, String, EntityId), StoreErrorKind>,
    unavailable: bool,
}

impl State {
    fn position(&self, collection: &str, id: &EntityId) -> Option<usize> {
        self.collections
            .get(collection)?
            .iter()
            .position(|doc| id_matches(doc, id))
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable {
            return Err(Error::store(StoreErrorKind::Connect, "store unavailable"));
        }
        Ok(())
    }

    fn check_injected(&self, op: WriteOp, collection: &str, id: &EntityId) -> Result<(), Error> {
        self.check_available()?;
        let key = (op, collection.to_string(), id.clone());
        if let Some(kind) = self.failures.get(&key) {
            tracing::debug!(op = %op, collection, id = %id, "Injected write failure");
            return Err(Error::store(*kind, format!("injected {} failure for {}", op, id)));
        }
        Ok(())
    }
}

fn id_matches(doc: &Document, id: &EntityId) -> bool {
    match doc.get(ID_FIELD) {
        Some(Value::String(s)) => s == id.as_str(),
        Some(other) => other.to_string() == id.as_str(),
        None => false,
    }
}

fn into_outcome<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

/// A process-local [`DocumentStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put documents into a collection directly. Not logged.
    pub fn seed(&self, collection: &str, documents: Vec<Document>) {
        let mut state = self.lock();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }

    /// Fetch a document without counting a read.
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        let state = self.lock();
        let id = EntityId::new(id);
        let pos = state.position(collection, &id)?;
        state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(pos))
            .cloned()
    }

    /// All documents of a collection, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.lock().collections.get(collection).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Successful writes, oldest first.
    pub fn write_log(&self) -> Vec<WriteEntry> {
        self.lock().log.clone()
    }

    pub fn clear_write_log(&self) {
        self.lock().log.clear();
    }

    /// Number of `find_by_id` and `find` calls served.
    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    /// Make every matching write fail with the given kind until cleared.
    pub fn fail_on(&self, op: WriteOp, collection: &str, id: &str, kind: StoreErrorKind) {
        self.lock()
            .failures
            .insert((op, collection.to_string(), EntityId::new(id)), kind);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Make every call fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn do_find_by_id(&self, collection: &str, id: &EntityId) -> Result<Option<Document>, Error> {
        let mut state = self.lock();
        state.check_available()?;
        state.reads += 1;
        let found = state
            .position(collection, id)
            .and_then(|pos| state.collections.get(collection)?.get(pos).cloned());
        tracing::trace!(collection, id = %id, found = found.is_some(), "Point read");
        Ok(found)
    }

    fn do_find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, Error> {
        let mut state = self.lock();
        state.check_available()?;
        state.reads += 1;
        let docs: Vec<Document> = state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tracing::trace!(collection, count = docs.len(), "Query");
        Ok(docs)
    }

    fn do_insert(&self, collection: &str, document: Document) -> Result<(), Error> {
        let id = match document.get(ID_FIELD) {
            Some(Value::String(s)) => EntityId::new(s.clone()),
            _ => {
                return Err(Error::store(
                    StoreErrorKind::Rejected,
                    format!("document without string '{}' field", ID_FIELD),
                ));
            }
        };
        let mut state = self.lock();
        state.check_injected(WriteOp::Insert, collection, &id)?;
        if state.position(collection, &id).is_some() {
            return Err(Error::store(
                StoreErrorKind::DuplicateKey,
                format!("duplicate key {}", id),
            ));
        }
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
        state.log.push(WriteEntry {
            op: WriteOp::Insert,
            collection: collection.to_string(),
            id,
        });
        Ok(())
    }

    fn do_update(&self, collection: &str, id: &EntityId, changes: Document) -> Result<(), Error> {
        let mut state = self.lock();
        state.check_injected(WriteOp::Update, collection, id)?;
        let Some(pos) = state.position(collection, id) else {
            return Err(Error::store(
                StoreErrorKind::NotFound,
                format!("no document {}", id),
            ));
        };
        if let Some(doc) = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(pos))
        {
            for (name, value) in changes {
                if name == ID_FIELD {
                    continue;
                }
                if value.is_null() {
                    doc.remove(&name);
                } else {
                    doc.insert(name, value);
                }
            }
        }
        state.log.push(WriteEntry {
            op: WriteOp::Update,
            collection: collection.to_string(),
            id: id.clone(),
        });
        Ok(())
    }

    fn do_delete(&self, collection: &str, id: &EntityId) -> Result<(), Error> {
        let mut state = self.lock();
        state.check_injected(WriteOp::Delete, collection, id)?;
        if let Some(pos) = state.position(collection, id) {
            if let Some(docs) = state.collections.get_mut(collection) {
                docs.remove(pos);
            }
        }
        state.log.push(WriteEntry {
            op: WriteOp::Delete,
            collection: collection.to_string(),
            id: id.clone(),
        });
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn find_by_id(
        &self,
        _cx: &Cx,
        collection: &str,
        id: &EntityId,
    ) -> impl Future<Output = Outcome<Option<Document>, Error>> + Send {
        let result = self.do_find_by_id(collection, id);
        async move { into_outcome(result) }
    }

    fn find(
        &self,
        _cx: &Cx,
        collection: &str,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<Vec<Document>, Error>> + Send {
        let result = self.do_find(collection, filter);
        async move { into_outcome(result) }
    }

    fn insert_one(
        &self,
        _cx: &Cx,
        collection: &str,
        document: Document,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.do_insert(collection, document);
        async move { into_outcome(result) }
    }

    fn update_by_id(
        &self,
        _cx: &Cx,
        collection: &str,
        id: &EntityId,
        changes: Document,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.do_update(collection, id, changes);
        async move { into_outcome(result) }
    }

    fn delete_by_id(
        &self,
        _cx: &Cx,
        collection: &str,
        id: &EntityId,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.do_delete(collection, id);
        async move { into_outcome(result) }
    }
}
