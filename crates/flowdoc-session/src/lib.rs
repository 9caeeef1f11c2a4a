//! Session and Unit of Work for flowdoc.
//!
//! `flowdoc-session` is the **unit-of-work layer**. It lets an engine written
//! against transactional, relational persistence run on a document store
//! that has neither multi-document transactions nor a query cache.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: ensures a single in-memory instance per `(collection, id)`.
//! - **Change tracking**: records inserts, updates, and deletes before flush.
//! - **Query cache**: caches query results and drops them when a tracked
//!   change could affect them.
//! - **Flush**: writes everything at the end of the unit of work, inserts
//!   before updates before deletes.
//!
//! # Design Philosophy
//!
//! - **No illusory rollback**: flush is best effort; partial failure is
//!   reported in full, never hidden.
//! - **Explicit registry**: managers and collections are registered on a
//!   `CollectionRegistry` that is passed in, never looked up globally.
//! - **Cancel-correct**: All async operations use `Cx` + `Outcome` via `flowdoc-core`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = factory.open();
//!
//! // Load by id (uses identity map)
//! let var = session.load(&cx, "variables", &id).await?;
//!
//! // Track changes
//! session.update(&var, changes)?;
//! session.insert(Entity::with_generated_id("variables"))?;
//!
//! // Write everything, then discard session state
//! session.flush(&cx).await?;
//! session.close();
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod query_cache;
pub mod registry;

pub use change_tracker::{ChangeTracker, PendingChange};
pub use flush::{
    FlushMode, FlushOrderer, FlushPlan, FlushResult, PendingOp, SerializedChanges,
    serialize_changes,
};
pub use identity_map::{EntityKey, IdentityMap};
pub use query_cache::QueryCache;
pub use registry::{CollectionBinding, CollectionHandle, CollectionRegistry, validate_collection_name};

use flowdoc_core::{
    CacheMatcher, ChangeEvent, Cx, Document, DocumentStore, Entity, EntityErrorKind, EntityId,
    EntityManager, EntityRef, Error, Filter, ID_FIELD, Intent, Outcome, Result, SessionErrorKind,
    read_entity, write_entity,
};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` from a before-flush callback vetoes the flush.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    after_close: Vec<SessionEventFn>,
}

impl fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("after_close", &self.after_close.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::AfterClose => &mut self.after_close,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after a flush in which every write succeeded.
    AfterFlush,
    /// Fired once, when the session is closed.
    AfterClose,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether finds with a cache key and matcher are cached.
    pub enable_query_cache: bool,
    /// What flush does after a failed write.
    pub flush_mode: FlushMode,
    /// Whether finds with a matcher merge in unflushed session entities.
    pub merge_unflushed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enable_query_cache: true,
            flush_mode: FlushMode::ContinueOnError,
            merge_unflushed: true,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the query cache (builder pattern).
    #[must_use]
    pub fn enable_query_cache(mut self, value: bool) -> Self {
        self.enable_query_cache = value;
        self
    }

    /// Set the flush mode (builder pattern).
    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Enable or disable merging of unflushed entities (builder pattern).
    #[must_use]
    pub fn merge_unflushed(mut self, value: bool) -> Self {
        self.merge_unflushed = value;
        self
    }
}

/// Options for `Session::find()`.
///
/// Entity managers build these: the cache key names the parameterized query
/// (for example `byExecutionId:{id}`), the matcher is its membership predicate.
#[derive(Clone, Default)]
pub struct FindOptions {
    /// Key under which the result is cached.
    pub cache_key: Option<String>,
    /// Membership predicate of the query.
    pub matcher: Option<Arc<dyn CacheMatcher>>,
}

impl FindOptions {
    /// Create new default options (no caching, no merging).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache the result under `key` (builder pattern).
    #[must_use]
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Set the query's membership predicate (builder pattern).
    #[must_use]
    pub fn matcher(mut self, matcher: impl CacheMatcher + 'static) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    /// Cache key and matcher in one call.
    #[must_use]
    pub fn cached(key: impl Into<String>, matcher: impl CacheMatcher + 'static) -> Self {
        Self::new().cache_key(key).matcher(matcher)
    }
}

impl fmt::Debug for FindOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindOptions")
            .field("cache_key", &self.cache_key)
            .field("matcher", &self.matcher.is_some())
            .finish()
    }
}

// ============================================================================
// Session State and Diagnostics
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting reads and changes.
    Open,
    /// Flush attempted; reads still allowed, changes rejected.
    Flushed,
    /// All session state discarded.
    Closed,
}

/// Pending change counts by intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub inserts: usize,
    /// Entities pending UPDATE.
    pub updates: usize,
    /// Entities pending DELETE.
    pub deletes: usize,
}

impl PendingCounts {
    /// Total number of pending writes.
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Counters collected over the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Loads served from the identity map.
    pub identity_hits: usize,
    /// Point reads and queries sent to the store.
    pub store_reads: usize,
    /// Finds served from the query cache.
    pub cache_hits: usize,
    /// Cacheable finds that had to query the store.
    pub cache_misses: usize,
    /// Cached results dropped because of tracked changes.
    pub cache_invalidations: usize,
}

/// Debug information about session state.
#[derive(Debug, Clone)]
pub struct SessionDebugInfo {
    pub state: SessionState,
    /// Entities in the identity map.
    pub tracked: usize,
    pub pending: PendingCounts,
    /// Cached query results.
    pub cached_queries: usize,
    pub stats: SessionStats,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It owns one identity map, one change tracker and one query cache for the
/// duration of a logical transaction, and writes the tracked changes to the
/// store on flush. A session is used by one caller at a time; sessions never
/// share in-memory state with each other.
pub struct Session<S: DocumentStore> {
    registry: Arc<CollectionRegistry<S>>,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    cache: QueryCache,
    config: SessionConfig,
    state: SessionState,
    event_callbacks: SessionEventCallbacks,
    stats: SessionStats,
}

impl<S: DocumentStore> Session<S> {
    /// Create a new session over a shared registry.
    pub fn new(registry: Arc<CollectionRegistry<S>>) -> Self {
        Self::with_config(registry, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(registry: Arc<CollectionRegistry<S>>, config: SessionConfig) -> Self {
        tracing::debug!(?config, "Opening session");
        Self {
            registry,
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            cache: QueryCache::new(),
            config,
            state: SessionState::Open,
            event_callbacks: SessionEventCallbacks::default(),
            stats: SessionStats::default(),
        }
    }

    pub fn registry(&self) -> &CollectionRegistry<S> {
        &self.registry
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can veto the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run when the session is closed.
    pub fn on_after_close(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_close.push(Box::new(f));
    }

    // ========================================================================
    // State checks
    // ========================================================================

    fn ensure_readable(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(Error::session(SessionErrorKind::Closed, "session is closed"));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Flushed => Err(Error::session(
                SessionErrorKind::AlreadyFlushed,
                "session was already flushed; changes would never be written",
            )),
            SessionState::Closed => {
                Err(Error::session(SessionErrorKind::Closed, "session is closed"))
            }
        }
    }

    /// Fail with `UnknownEntity` unless `entity` is the reference this
    /// session tracks for `key`.
    fn ensure_tracked(&self, key: &EntityKey, entity: &EntityRef) -> Result<()> {
        let tracked = self
            .identity_map
            .get(key)
            .is_some_and(|known| Arc::ptr_eq(&known, entity));
        if tracked {
            Ok(())
        } else {
            Err(Error::entity(
                EntityErrorKind::Unknown,
                key.collection.clone(),
                key.id.clone(),
            ))
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Load an entity by id.
    ///
    /// Checks the identity map first and never re-reads an entity already in
    /// the session. Entities pending delete are still returned; entities
    /// whose insert was collapsed by a delete are not.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load(
        &mut self,
        cx: &Cx,
        collection: &str,
        id: &EntityId,
    ) -> Outcome<Option<EntityRef>, Error> {
        if let Err(e) = self.ensure_readable() {
            return Outcome::Err(e);
        }

        let key = EntityKey::new(collection, id.clone());
        if let Some(existing) = self.identity_map.get(&key) {
            self.stats.identity_hits += 1;
            tracing::trace!("Identity map hit");
            return Outcome::Ok(Some(existing));
        }
        if self.tracker.is_deleted(&key) {
            return Outcome::Ok(None);
        }

        let registry = Arc::clone(&self.registry);
        let handle = match registry.handle(collection) {
            Ok(handle) => handle,
            Err(e) => return Outcome::Err(e),
        };

        self.stats.store_reads += 1;
        let document = match handle.find_by_id(cx, id).await {
            Outcome::Ok(Some(document)) => document,
            Outcome::Ok(None) => return Outcome::Ok(None),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match self.register_loaded(handle.manager(), collection, document) {
            Ok(entity) => Outcome::Ok(Some(entity)),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Deserialize a stored document and route it through the identity map.
    ///
    /// An entity already in the session wins over the freshly read copy.
    fn register_loaded(
        &mut self,
        manager: &dyn EntityManager,
        collection: &str,
        document: Document,
    ) -> Result<EntityRef> {
        let entity = manager.deserialize(document)?;
        let key = EntityKey::new(collection, entity.id().clone());
        if let Some(existing) = self.identity_map.get(&key) {
            return Ok(existing);
        }

        let entity = if entity.collection() == collection {
            entity
        } else {
            Entity::from_fields(collection, entity.id().clone(), entity.fields().clone())
        };
        self.tracker.snapshot(key, entity.to_document());
        Ok(self.identity_map.insert(entity))
    }

    /// Query a collection.
    ///
    /// With a cache key (and the query cache enabled) a still-valid cached
    /// result is returned without touching the store. Otherwise the store is
    /// queried and every hit is routed through the identity map. Entities
    /// pending delete are dropped. With a matcher, unflushed session entities
    /// that match are merged in, and updated entities that no longer match
    /// are dropped. The result is cached only when both a key and a matcher
    /// are given.
    #[tracing::instrument(level = "debug", skip(self, cx, options))]
    pub async fn find(
        &mut self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Outcome<Vec<EntityRef>, Error> {
        if let Err(e) = self.ensure_readable() {
            return Outcome::Err(e);
        }

        let cache_key = options
            .cache_key
            .as_deref()
            .filter(|_| self.config.enable_query_cache);
        if let Some(key) = cache_key {
            if let Some(hit) = self.cache.lookup(collection, key) {
                self.stats.cache_hits += 1;
                tracing::debug!(key, size = hit.len(), "Query cache hit");
                return Outcome::Ok(hit);
            }
            self.stats.cache_misses += 1;
        }

        let registry = Arc::clone(&self.registry);
        let handle = match registry.handle(collection) {
            Ok(handle) => handle,
            Err(e) => return Outcome::Err(e),
        };

        self.stats.store_reads += 1;
        let documents = match handle.find(cx, filter).await {
            Outcome::Ok(documents) => documents,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let fetched = documents.len();

        let merge_with = options
            .matcher
            .as_ref()
            .filter(|_| self.config.merge_unflushed);
        let mut result: Vec<EntityRef> = Vec::with_capacity(fetched);

        for document in documents {
            let entity = match handle.manager().deserialize(document) {
                Ok(entity) => entity,
                Err(e) => return Outcome::Err(e),
            };
            let key = EntityKey::new(collection, entity.id().clone());
            if self.tracker.is_deleted(&key) {
                continue;
            }
            let entity = if let Some(existing) = self.identity_map.get(&key) {
                existing
            } else {
                self.tracker.snapshot(key.clone(), entity.to_document());
                self.identity_map.insert(entity)
            };
            if let Some(matcher) = merge_with {
                if self.tracker.intent_of(&key) == Intent::Updated
                    && !matcher.matches(&read_entity(&entity).to_document())
                {
                    continue;
                }
            }
            result.push(entity);
        }

        if let Some(matcher) = merge_with {
            for entity in self.identity_map.all(collection) {
                if result.iter().any(|r| Arc::ptr_eq(r, &entity)) {
                    continue;
                }
                let key = EntityKey::of_ref(&entity);
                let pending = matches!(
                    self.tracker.intent_of(&key),
                    Intent::Inserted | Intent::Updated
                );
                if pending && matcher.matches(&read_entity(&entity).to_document()) {
                    result.push(entity);
                }
            }
        }

        tracing::debug!(
            fetched,
            returned = result.len(),
            "Query complete"
        );

        if let Some(key) = cache_key {
            self.cache
                .store(collection, key, &result, options.matcher.clone());
        }
        Outcome::Ok(result)
    }

    /// Query a collection and return the first result.
    pub async fn find_one(
        &mut self,
        cx: &Cx,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        match self.find(cx, collection, filter, options).await {
            Outcome::Ok(found) => Outcome::Ok(found.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Add a new entity to the session.
    ///
    /// The entity will be inserted on the next `flush()` call.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(collection = entity.collection(), id = %entity.id()))]
    pub fn insert(&mut self, entity: Entity) -> Result<EntityRef> {
        self.ensure_writable()?;
        let key = EntityKey::of(&entity);
        self.tracker.ensure_live(&key)?;
        if self.identity_map.contains(&key) {
            return Err(Error::entity(
                EntityErrorKind::Duplicate,
                key.collection,
                key.id,
            ));
        }
        self.registry.binding(&key.collection)?;

        let entity = self.identity_map.insert(entity);
        self.tracker.mark_inserted(key.clone(), Arc::clone(&entity))?;
        self.invalidate(&key, &entity, Intent::Inserted, &[]);
        Ok(entity)
    }

    /// Apply a change set to a tracked entity.
    ///
    /// Every entry of `changes` overwrites the field of the same name. The
    /// change set may repeat the entity's own id under `_id` but may not
    /// change it. An empty change set is a no-op.
    #[tracing::instrument(level = "debug", skip(self, entity, changes))]
    pub fn update(&mut self, entity: &EntityRef, mut changes: Document) -> Result<()> {
        self.ensure_writable()?;
        let key = EntityKey::of_ref(entity);
        self.tracker.ensure_live(&key)?;
        self.ensure_tracked(&key, entity)?;
        if let Some(id) = changes.remove(ID_FIELD) {
            if id.as_str() != Some(key.id.as_str()) {
                return Err(Error::entity(
                    EntityErrorKind::IdChange,
                    key.collection,
                    key.id,
                ));
            }
        }
        if changes.is_empty() {
            return Ok(());
        }

        let before = read_entity(entity).to_document();
        write_entity(entity).apply(&changes);
        let intent = self
            .tracker
            .mark_updated(key.clone(), Arc::clone(entity), &changes)?;
        tracing::trace!(key = %key, %intent, fields = changes.len(), "Tracked update");
        let after = read_entity(entity).to_document();
        let mut previous: Vec<Document> = self
            .tracker
            .record_state(key.clone(), after)
            .into_iter()
            .collect();
        previous.push(before);
        self.invalidate(&key, entity, Intent::Updated, &previous);
        Ok(())
    }

    /// Detect in-place mutations of a loaded entity and track them as an update.
    ///
    /// Compares the entity against its load snapshot and returns the names of
    /// the changed fields. Cached queries are invalidated against the state
    /// the entity had at its last tracked load or change. Changes to an
    /// entity pending insert need no tracking; the insert writes the entity
    /// as it is at flush time.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn mark_dirty(&mut self, entity: &EntityRef) -> Result<Vec<String>> {
        self.ensure_writable()?;
        let key = EntityKey::of_ref(entity);
        self.tracker.ensure_live(&key)?;
        self.ensure_tracked(&key, entity)?;
        if self.tracker.intent_of(&key) == Intent::Inserted {
            return Ok(Vec::new());
        }

        let current = read_entity(entity).to_document();
        let changed = self.tracker.changed_fields(&key, &current);
        let names: Vec<String> = changed.keys().cloned().collect();
        if changed.is_empty() {
            return Ok(names);
        }

        self.tracker
            .mark_updated(key.clone(), Arc::clone(entity), &changed)?;
        let previous = self.tracker.record_state(key.clone(), current);
        self.invalidate(&key, entity, Intent::Updated, previous.as_slice());
        Ok(names)
    }

    /// Mark a tracked entity for deletion.
    ///
    /// Deleting an entity inserted in this session cancels the insert; the
    /// entity then disappears from the session entirely.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn delete(&mut self, collection: &str, entity: &EntityRef) -> Result<()> {
        self.ensure_writable()?;
        let key = EntityKey::new(collection, read_entity(entity).id().clone());
        self.tracker.ensure_live(&key)?;
        self.ensure_tracked(&key, entity)?;

        let previous = self.tracker.last_state(&key).cloned();
        let intent = self.tracker.mark_deleted(key.clone(), Arc::clone(entity))?;
        if intent == Intent::None {
            self.identity_map.remove(&key);
        }
        self.invalidate(&key, entity, Intent::Deleted, previous.as_slice());
        Ok(())
    }

    /// Drop every cached query result the change could affect.
    ///
    /// `previous` lists the states the entity may have had in cached results.
    fn invalidate(
        &mut self,
        key: &EntityKey,
        entity: &EntityRef,
        intent: Intent,
        previous: &[Document],
    ) {
        if !self.config.enable_query_cache || self.cache.is_empty() {
            return;
        }
        let guard = read_entity(entity);
        let mut dropped = 0;
        if previous.is_empty() {
            dropped += self.cache.invalidate_for_change(&ChangeEvent {
                collection: &key.collection,
                entity: &guard,
                previous: None,
                intent,
            });
        }
        for (i, state) in previous.iter().enumerate() {
            if previous[..i].contains(state) {
                continue;
            }
            dropped += self.cache.invalidate_for_change(&ChangeEvent {
                collection: &key.collection,
                entity: &guard,
                previous: Some(state),
                intent,
            });
        }
        self.stats.cache_invalidations += dropped;
    }

    // ========================================================================
    // Flush and Close
    // ========================================================================

    /// Write all tracked changes to the store.
    ///
    /// Inserts are written first, then updates, then deletes. Each write is
    /// independent: if any write fails the result is
    /// `Error::FlushPartialFailure`, and the writes listed as succeeded are
    /// already applied to the store. There is no rollback and no retry.
    /// Tracked updates that serialize to no field are not written and are
    /// listed in [`FlushResult::unwritten`].
    ///
    /// Only an open session can be flushed, once. A serialization failure
    /// or a veto from a before-flush callback happens before any write and
    /// leaves the session open.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        match self.state {
            SessionState::Open => {}
            SessionState::Flushed => {
                return Outcome::Err(Error::session(
                    SessionErrorKind::AlreadyFlushed,
                    "session was already flushed",
                ));
            }
            SessionState::Closed => {
                return Outcome::Err(Error::session(SessionErrorKind::Closed, "session is closed"));
            }
        }

        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            tracing::debug!(error = %e, "Flush vetoed");
            return Outcome::Err(Error::session(
                SessionErrorKind::FlushVetoed,
                format!("flush vetoed by before-flush callback: {}", e),
            ));
        }

        let registry = Arc::clone(&self.registry);
        let registry = registry.as_ref();
        let pending = self.tracker.pending_changes();
        let serialized = match serialize_changes(registry, &pending) {
            Ok(serialized) => serialized,
            Err(e) => return Outcome::Err(e),
        };
        let plan = FlushOrderer::from_registry(registry).plan(serialized);
        self.state = SessionState::Flushed;

        if plan.is_empty() {
            tracing::debug!("Nothing to flush");
        }

        match plan.execute(cx, registry, self.config.flush_mode).await {
            Outcome::Ok(result) => {
                if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(result)
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Discard the identity map, change tracker and query cache.
    ///
    /// Unflushed changes are lost. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let pending = self.pending_counts();
        if !pending.is_empty() && self.state == SessionState::Open {
            tracing::debug!(pending = pending.total(), "Closing session with unflushed changes");
        }
        self.identity_map.clear();
        self.tracker.clear();
        self.cache.clear();
        self.state = SessionState::Closed;
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterClose) {
            tracing::warn!(error = %e, "After-close callback failed");
        }
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Tracked intent of an entity. Untracked entities report `Intent::None`.
    pub fn intent_of(&self, collection: &str, id: &EntityId) -> Intent {
        self.tracker
            .intent_of(&EntityKey::new(collection, id.clone()))
    }

    /// Is the entity in the identity map?
    pub fn contains(&self, collection: &str, id: &EntityId) -> bool {
        self.identity_map
            .contains(&EntityKey::new(collection, id.clone()))
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let (inserts, updates, deletes) = self.tracker.pending_counts();
        PendingCounts {
            inserts,
            updates,
            deletes,
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            state: self.state,
            tracked: self.identity_map.len(),
            pending: self.pending_counts(),
            cached_queries: self.cache.len(),
            stats: self.stats,
        }
    }
}

impl<S: DocumentStore> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("tracked", &self.identity_map.len())
            .field("pending", &self.pending_counts())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Opens sessions over one shared registry.
pub struct SessionFactory<S: DocumentStore> {
    registry: Arc<CollectionRegistry<S>>,
    config: SessionConfig,
}

impl<S: DocumentStore> SessionFactory<S> {
    pub fn new(registry: CollectionRegistry<S>) -> Self {
        Self::with_config(registry, SessionConfig::default())
    }

    pub fn with_config(registry: CollectionRegistry<S>, config: SessionConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    /// Open a session with the factory's configuration.
    pub fn open(&self) -> Session<S> {
        Session::with_config(Arc::clone(&self.registry), self.config.clone())
    }

    /// Open a session with a one-off configuration.
    pub fn open_with(&self, config: SessionConfig) -> Session<S> {
        Session::with_config(Arc::clone(&self.registry), config)
    }

    pub fn registry(&self) -> &CollectionRegistry<S> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl<S: DocumentStore> Clone for SessionFactory<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use flowdoc_core::{DocumentManager, FieldEquals};
    use flowdoc_memory::{MemoryStore, WriteOp};
    use serde_json::json;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected error, got: {other:?}")),
        }
    }

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    fn setup() -> (MemoryStore, SessionFactory<MemoryStore>) {
        let store = MemoryStore::new();
        store.seed(
            "variables",
            vec![
                doc(json!({"_id": "v1", "executionId": "e1", "name": "a", "value": 1})),
                doc(json!({"_id": "v2", "executionId": "e1", "name": "b", "value": 2})),
                doc(json!({"_id": "v3", "executionId": "e2", "name": "c", "value": 3})),
            ],
        );
        let mut registry = CollectionRegistry::new(store.clone());
        registry
            .register(Arc::new(DocumentManager::new("variables")))
            .unwrap();
        registry
            .register(Arc::new(DocumentManager::new("tasks")))
            .unwrap();
        (store, SessionFactory::new(registry))
    }

    fn by_execution(execution: &str) -> FindOptions {
        FindOptions::cached(
            format!("byExecutionId:{}", execution),
            FieldEquals::new("executionId", execution),
        )
    }

    fn id(s: &str) -> EntityId {
        EntityId::new(s)
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.enable_query_cache);
        assert!(config.merge_unflushed);
        assert_eq!(config.flush_mode, FlushMode::ContinueOnError);

        let config = SessionConfig::new()
            .enable_query_cache(false)
            .flush_mode(FlushMode::FailFast);
        assert!(!config.enable_query_cache);
        assert_eq!(config.flush_mode, FlushMode::FailFast);
    }

    #[test]
    fn test_load_returns_same_reference() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let first = unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).unwrap();
            let second = unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).unwrap();
            assert!(Arc::ptr_eq(&first, &second));

            let missing = unwrap_outcome(session.load(&cx, "variables", &id("nope")).await);
            assert!(missing.is_none());
        });

        assert_eq!(store.reads(), 2);
        assert_eq!(session.stats().identity_hits, 1);
    }

    #[test]
    fn test_load_unknown_collection() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let err = expect_err(session.load(&cx, "jobs", &id("j1")).await);
            assert_eq!(err.session_kind(), Some(SessionErrorKind::UnknownCollection));
        });
    }

    #[test]
    fn test_find_routes_hits_through_identity_map() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let loaded = unwrap_outcome(session.load(&cx, "variables", &id("v2")).await).unwrap();
            let found = unwrap_outcome(
                session
                    .find(&cx, "variables", &Filter::eq("executionId", "e1"), FindOptions::new())
                    .await,
            );
            assert_eq!(found.len(), 2);
            assert!(Arc::ptr_eq(&found[1], &loaded));
        });
    }

    #[test]
    fn test_insert_duplicate_and_stale() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let v1 = unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).unwrap();

            let err = session.insert(Entity::new("variables", "v1")).unwrap_err();
            assert!(err.is_duplicate_entity());
            assert_eq!(session.intent_of("variables", &id("v1")), Intent::None);

            session.delete("variables", &v1).unwrap();
            let err = session.insert(Entity::new("variables", "v1")).unwrap_err();
            assert!(err.is_stale_entity());
            let err = session.update(&v1, doc(json!({"value": 5}))).unwrap_err();
            assert!(err.is_stale_entity());
            let err = session.delete("variables", &v1).unwrap_err();
            assert!(err.is_stale_entity());

            // Pending deletes are still visible to load, but not to find.
            let again = unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).unwrap();
            assert!(Arc::ptr_eq(&again, &v1));
            let found = unwrap_outcome(
                session
                    .find(&cx, "variables", &Filter::eq("executionId", "e1"), FindOptions::new())
                    .await,
            );
            assert_eq!(found.len(), 1);
        });
    }

    #[test]
    fn test_insert_unknown_collection() {
        let (_store, factory) = setup();
        let mut session = factory.open();
        let err = session.insert(Entity::new("jobs", "j1")).unwrap_err();
        assert_eq!(err.session_kind(), Some(SessionErrorKind::UnknownCollection));
        assert!(!session.contains("jobs", &id("j1")));
    }

    #[test]
    fn test_update_requires_tracked_reference() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut session = factory.open();

        let lookalike = Entity::new("variables", "v1").into_ref();
        let err = session.update(&lookalike, doc(json!({"value": 9}))).unwrap_err();
        assert!(err.is_unknown_entity());

        rt.block_on(async {
            unwrap_outcome(session.load(&cx, "variables", &id("v1")).await);
        });
        let err = session.update(&lookalike, doc(json!({"value": 9}))).unwrap_err();
        assert!(err.is_unknown_entity());
        let err = session.delete("variables", &lookalike).unwrap_err();
        assert!(err.is_unknown_entity());
    }

    #[test]
    fn test_update_rejects_id_change_and_ignores_empty() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let v1 = unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).unwrap();

            let err = session.update(&v1, doc(json!({"_id": "other", "value": 7}))).unwrap_err();
            assert_eq!(err.entity_kind(), Some(EntityErrorKind::IdChange));
            assert_eq!(read_entity(&v1).get("value"), Some(&json!(1)));

            session.update(&v1, Document::new()).unwrap();
            session.update(&v1, doc(json!({"_id": "v1"}))).unwrap();
            assert_eq!(session.intent_of("variables", &id("v1")), Intent::None);

            session.update(&v1, doc(json!({"_id": "v1", "value": 7}))).unwrap();
            assert_eq!(session.intent_of("variables", &id("v1")), Intent::Updated);
            assert_eq!(read_entity(&v1).get("value"), Some(&json!(7)));
        });
    }

    #[test]
    fn test_mark_dirty_detects_in_place_changes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let v1 = unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).unwrap();
            assert!(session.mark_dirty(&v1).unwrap().is_empty());

            write_entity(&v1).set("value", 10);
            assert_eq!(session.mark_dirty(&v1).unwrap(), vec!["value".to_string()]);
            assert_eq!(session.pending_counts().updates, 1);

            unwrap_outcome(session.flush(&cx).await);
        });

        assert_eq!(store.get("variables", "v1").unwrap().get("value"), Some(&json!(10)));
    }

    #[test]
    fn test_in_place_change_leaves_query_of_last_tracked_state() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();
        let e2 = Filter::eq("executionId", "e2");

        rt.block_on(async {
            let v1 = unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).unwrap();
            session.update(&v1, doc(json!({"executionId": "e2"}))).unwrap();

            let cached = unwrap_outcome(session.find(&cx, "variables", &e2, by_execution("e2")).await);
            assert_eq!(cached.len(), 2);
            assert!(cached.iter().any(|e| Arc::ptr_eq(e, &v1)));

            write_entity(&v1).set("executionId", "e3");
            assert_eq!(session.mark_dirty(&v1).unwrap(), vec!["executionId".to_string()]);

            let now_e2 = unwrap_outcome(session.find(&cx, "variables", &e2, by_execution("e2")).await);
            assert_eq!(now_e2.len(), 1);
            assert!(!now_e2.iter().any(|e| Arc::ptr_eq(e, &v1)));
            assert_eq!(store.reads(), 3);

            // A delete is matched against the last tracked state too.
            let v2 = unwrap_outcome(session.load(&cx, "variables", &id("v2")).await).unwrap();
            session.update(&v2, doc(json!({"executionId": "e2"}))).unwrap();
            let cached = unwrap_outcome(session.find(&cx, "variables", &e2, by_execution("e2")).await);
            assert!(cached.iter().any(|e| Arc::ptr_eq(e, &v2)));
            write_entity(&v2).set("executionId", "e4");
            session.delete("variables", &v2).unwrap();

            let after_delete = unwrap_outcome(session.find(&cx, "variables", &e2, by_execution("e2")).await);
            assert!(!after_delete.iter().any(|e| Arc::ptr_eq(e, &v2)));
        });
    }

    #[test]
    fn test_cached_find_served_without_store_read() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();
        let filter = Filter::eq("executionId", "e1");

        rt.block_on(async {
            let first = unwrap_outcome(session.find(&cx, "variables", &filter, by_execution("e1")).await);
            let second = unwrap_outcome(session.find(&cx, "variables", &filter, by_execution("e1")).await);
            assert_eq!(first.len(), 2);
            assert_eq!(second.len(), 2);
            assert!(Arc::ptr_eq(&first[0], &second[0]));
        });

        assert_eq!(store.reads(), 1);
        let stats = session.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[test]
    fn test_no_matcher_means_no_caching() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();
        let filter = Filter::eq("executionId", "e1");

        rt.block_on(async {
            for _ in 0..2 {
                unwrap_outcome(
                    session
                        .find(&cx, "variables", &filter, FindOptions::new().cache_key("k"))
                        .await,
                );
            }
        });
        assert_eq!(store.reads(), 2);
        assert_eq!(session.debug_state().cached_queries, 0);
    }

    #[test]
    fn test_insert_invalidates_and_merges_into_find() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();
        let filter = Filter::eq("executionId", "e1");

        rt.block_on(async {
            unwrap_outcome(session.find(&cx, "variables", &filter, by_execution("e1")).await);
            unwrap_outcome(session.find(&cx, "variables", &Filter::eq("executionId", "e2"), by_execution("e2")).await);

            let new_var = session
                .insert(Entity::new("variables", "v9").with_field("executionId", "e1"))
                .unwrap();
            assert_eq!(session.stats().cache_invalidations, 1);

            let found = unwrap_outcome(session.find(&cx, "variables", &filter, by_execution("e1")).await);
            assert_eq!(found.len(), 3);
            assert!(found.iter().any(|e| Arc::ptr_eq(e, &new_var)));

            // The e2 entry was not affected.
            unwrap_outcome(session.find(&cx, "variables", &Filter::eq("executionId", "e2"), by_execution("e2")).await);
        });

        assert_eq!(store.reads(), 3);
    }

    #[test]
    fn test_update_moves_entity_between_cached_queries() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let e1 = unwrap_outcome(
                session
                    .find(&cx, "variables", &Filter::eq("executionId", "e1"), by_execution("e1"))
                    .await,
            );
            unwrap_outcome(
                session
                    .find(&cx, "variables", &Filter::eq("executionId", "e2"), by_execution("e2"))
                    .await,
            );

            session.update(&e1[0], doc(json!({"executionId": "e2"}))).unwrap();
            assert_eq!(session.stats().cache_invalidations, 2);

            // The store still says e1, the session knows better.
            let now_e1 = unwrap_outcome(
                session
                    .find(&cx, "variables", &Filter::eq("executionId", "e1"), by_execution("e1"))
                    .await,
            );
            assert_eq!(now_e1.len(), 1);
            let now_e2 = unwrap_outcome(
                session
                    .find(&cx, "variables", &Filter::eq("executionId", "e2"), by_execution("e2"))
                    .await,
            );
            assert_eq!(now_e2.len(), 2);
        });
    }

    #[test]
    fn test_flush_then_flush_again_fails() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let v1 = unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).unwrap();
            session.update(&v1, doc(json!({"value": 5}))).unwrap();
            session.update(&v1, doc(json!({"name": "z"}))).unwrap();
            let result = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(result.updated, 1);
            assert_eq!(session.state(), SessionState::Flushed);

            let err = expect_err(session.flush(&cx).await);
            assert_eq!(err.session_kind(), Some(SessionErrorKind::AlreadyFlushed));
            let err = session.insert(Entity::new("variables", "late")).unwrap_err();
            assert_eq!(err.session_kind(), Some(SessionErrorKind::AlreadyFlushed));

            // Reads are still allowed after flush.
            assert!(unwrap_outcome(session.load(&cx, "variables", &id("v1")).await).is_some());
        });

        let log = store.write_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].op, WriteOp::Update);
    }

    #[test]
    fn test_before_flush_veto_keeps_session_open() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();
        session.insert(Entity::new("variables", "v9")).unwrap();
        session.on_before_flush(|| Err(Error::Custom("not now".into())));

        rt.block_on(async {
            let err = expect_err(session.flush(&cx).await);
            assert_eq!(err.session_kind(), Some(SessionErrorKind::FlushVetoed));
        });
        assert_eq!(session.state(), SessionState::Open);
        assert!(store.write_log().is_empty());
    }

    #[test]
    fn test_events_fire() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut session = factory.open();

        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        for (name, event) in [
            ("before", SessionEvent::BeforeFlush),
            ("after", SessionEvent::AfterFlush),
            ("close", SessionEvent::AfterClose),
        ] {
            let fired = Arc::clone(&fired);
            let cb = move || {
                fired.lock().unwrap().push(name);
                Ok::<(), Error>(())
            };
            match event {
                SessionEvent::BeforeFlush => session.on_before_flush(cb),
                SessionEvent::AfterFlush => session.on_after_flush(cb),
                SessionEvent::AfterClose => session.on_after_close(cb),
            }
        }

        rt.block_on(async {
            unwrap_outcome(session.flush(&cx).await);
        });
        session.close();
        session.close();
        assert_eq!(*fired.lock().unwrap(), vec!["before", "after", "close"]);
    }

    #[test]
    fn test_close_discards_everything() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            unwrap_outcome(session.find(&cx, "variables", &Filter::All, by_execution("all")).await);
        });
        session.insert(Entity::new("variables", "v9")).unwrap();
        session.close();

        let info = session.debug_state();
        assert_eq!(info.state, SessionState::Closed);
        assert_eq!(info.tracked, 0);
        assert!(info.pending.is_empty());
        assert_eq!(info.cached_queries, 0);

        rt.block_on(async {
            let err = expect_err(session.load(&cx, "variables", &id("v1")).await);
            assert_eq!(err.session_kind(), Some(SessionErrorKind::Closed));
            let err = expect_err(session.flush(&cx).await);
            assert_eq!(err.session_kind(), Some(SessionErrorKind::Closed));
        });
        assert!(store.write_log().is_empty());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut a = factory.open();
        let mut b = factory.open();

        rt.block_on(async {
            let in_a = unwrap_outcome(a.load(&cx, "variables", &id("v1")).await).unwrap();
            let in_b = unwrap_outcome(b.load(&cx, "variables", &id("v1")).await).unwrap();
            assert!(!Arc::ptr_eq(&in_a, &in_b));
        });
        a.insert(Entity::new("variables", "v9")).unwrap();
        assert!(!b.contains("variables", &id("v9")));
    }

    #[test]
    fn test_find_one() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (_store, factory) = setup();
        let mut session = factory.open();

        rt.block_on(async {
            let found = unwrap_outcome(
                session
                    .find_one(&cx, "variables", &Filter::eq("name", "c"), FindOptions::new())
                    .await,
            )
            .unwrap();
            assert_eq!(read_entity(&found).id().as_str(), "v3");
            let none = unwrap_outcome(
                session
                    .find_one(&cx, "variables", &Filter::eq("name", "zz"), FindOptions::new())
                    .await,
            );
            assert!(none.is_none());
        });
    }
}
