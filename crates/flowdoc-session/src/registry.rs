//! Collection registry.
//!
//! Maps each logical collection name to the store-side collection name and
//! the [`EntityManager`] that (de)serializes its entities. The registry owns
//! the store and is built once, then shared by every session via `Arc`.

use flowdoc_core::{
    Cx, Document, DocumentStore, EntityId, EntityManager, Error, Filter, Outcome, Result,
    SessionErrorKind,
};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Allowed shape of a logical collection name.
const COLLECTION_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.-]*$";

fn collection_name_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| match Regex::new(COLLECTION_NAME_PATTERN) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(error = %e, "Invalid collection name pattern");
                None
            }
        })
        .as_ref()
}

/// Check a logical collection name.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = collection_name_regex().is_some_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(Error::config(format!("invalid collection name '{}'", name)))
    }
}

/// Registration of one logical collection.
pub struct CollectionBinding {
    store_collection: String,
    manager: Arc<dyn EntityManager>,
    depends_on: Vec<String>,
}

impl CollectionBinding {
    /// Store-side collection name (prefix applied).
    pub fn store_collection(&self) -> &str {
        &self.store_collection
    }

    pub fn manager(&self) -> &dyn EntityManager {
        self.manager.as_ref()
    }

    /// Collections this collection references.
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

impl fmt::Debug for CollectionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionBinding")
            .field("store_collection", &self.store_collection)
            .field("manager", &self.manager.collection())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Owns the store and the per-collection bindings.
pub struct CollectionRegistry<S> {
    store: S,
    prefix: String,
    bindings: HashMap<String, CollectionBinding>,
}

impl<S: DocumentStore> CollectionRegistry<S> {
    /// Create an empty registry over a store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            prefix: String::new(),
            bindings: HashMap::new(),
        }
    }

    /// Prefix applied to every store-side collection name registered afterwards.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Register the manager for its collection.
    pub fn register(&mut self, manager: Arc<dyn EntityManager>) -> Result<()> {
        self.register_with_dependencies(manager, &[])
    }

    /// Register a manager together with the collections its entities reference.
    ///
    /// Parent collections are inserted before, and deleted after, this one.
    #[tracing::instrument(level = "debug", skip(self, manager))]
    pub fn register_with_dependencies(
        &mut self,
        manager: Arc<dyn EntityManager>,
        depends_on: &[&str],
    ) -> Result<()> {
        let collection = manager.collection().to_string();
        validate_collection_name(&collection)?;
        for parent in depends_on {
            validate_collection_name(parent)?;
            if *parent == collection {
                return Err(Error::config(format!(
                    "collection '{}' cannot depend on itself",
                    collection
                )));
            }
        }
        if self.bindings.contains_key(&collection) {
            return Err(Error::config(format!(
                "collection '{}' is already registered",
                collection
            )));
        }

        let store_collection = format!("{}{}", self.prefix, collection);
        tracing::debug!(store_collection = %store_collection, "Registered collection");
        self.bindings.insert(
            collection,
            CollectionBinding {
                store_collection,
                manager,
                depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
            },
        );
        Ok(())
    }

    /// Binding of a collection, or `UnknownCollection`.
    pub fn binding(&self, collection: &str) -> Result<&CollectionBinding> {
        self.bindings.get(collection).ok_or_else(|| {
            Error::session(
                SessionErrorKind::UnknownCollection,
                format!("no manager registered for collection '{}'", collection),
            )
        })
    }

    /// Store handle for one collection.
    pub fn handle<'a>(&'a self, collection: &'a str) -> Result<CollectionHandle<'a, S>> {
        let binding = self.binding(collection)?;
        Ok(CollectionHandle {
            store: &self.store,
            collection,
            binding,
        })
    }

    pub fn is_registered(&self, collection: &str) -> bool {
        self.bindings.contains_key(collection)
    }

    /// Registered logical collection names, sorted.
    pub fn collections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> fmt::Debug for CollectionRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionRegistry")
            .field("prefix", &self.prefix)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Collection Handle
// ============================================================================

/// Store access scoped to one logical collection.
///
/// Store errors coming out of a handle are annotated with the logical
/// collection name.
pub struct CollectionHandle<'a, S> {
    store: &'a S,
    collection: &'a str,
    binding: &'a CollectionBinding,
}

impl<'a, S: DocumentStore> CollectionHandle<'a, S> {
    pub fn collection(&self) -> &'a str {
        self.collection
    }

    pub fn store_collection(&self) -> &'a str {
        &self.binding.store_collection
    }

    pub fn manager(&self) -> &'a dyn EntityManager {
        self.binding.manager.as_ref()
    }

    pub async fn find_by_id(&self, cx: &Cx, id: &EntityId) -> Outcome<Option<Document>, Error> {
        let outcome = self
            .store
            .find_by_id(cx, &self.binding.store_collection, id)
            .await;
        annotate(outcome, self.collection)
    }

    pub async fn find(&self, cx: &Cx, filter: &Filter) -> Outcome<Vec<Document>, Error> {
        let outcome = self
            .store
            .find(cx, &self.binding.store_collection, filter)
            .await;
        annotate(outcome, self.collection)
    }

    pub async fn insert_one(&self, cx: &Cx, document: Document) -> Outcome<(), Error> {
        let outcome = self
            .store
            .insert_one(cx, &self.binding.store_collection, document)
            .await;
        annotate(outcome, self.collection)
    }

    pub async fn update_by_id(
        &self,
        cx: &Cx,
        id: &EntityId,
        changes: Document,
    ) -> Outcome<(), Error> {
        let outcome = self
            .store
            .update_by_id(cx, &self.binding.store_collection, id, changes)
            .await;
        annotate(outcome, self.collection)
    }

    pub async fn delete_by_id(&self, cx: &Cx, id: &EntityId) -> Outcome<(), Error> {
        let outcome = self
            .store
            .delete_by_id(cx, &self.binding.store_collection, id)
            .await;
        annotate(outcome, self.collection)
    }
}

fn annotate<T>(outcome: Outcome<T, Error>, collection: &str) -> Outcome<T, Error> {
    match outcome {
        Outcome::Err(Error::Store(e)) if e.collection.is_none() => {
            Outcome::Err(Error::Store(e.with_collection(collection)))
        }
        other => other,
    }
}
