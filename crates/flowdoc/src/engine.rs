//! Persistence engine: the configured entry point of flowdoc.
//!
//! The engine owns the collection registry (and through it the store) and
//! the configuration, and opens sessions. It is built once by the component
//! that sets up storage and then shared; nothing is registered globally.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = PersistenceEngine::builder(MemoryStore::new())
//!     .collection_prefix("act_")
//!     .register(Arc::new(DocumentManager::new("executions")))
//!     .build()?;
//!
//! let mut session = engine.open_session();
//! ```

use crate::config::PersistenceConfig;
use crate::variables::VariableInstanceManager;
use flowdoc_core::{DocumentStore, EntityManager, Result};
use flowdoc_session::{
    CollectionRegistry, FlushMode, Session, SessionConfig, SessionFactory,
};
use std::fmt;
use std::sync::Arc;

/// Opens sessions over one configured store.
pub struct PersistenceEngine<S: DocumentStore> {
    config: PersistenceConfig,
    factory: SessionFactory<S>,
}

impl<S: DocumentStore> PersistenceEngine<S> {
    /// Start building an engine over a store.
    #[must_use]
    pub fn builder(store: S) -> PersistenceEngineBuilder<S> {
        PersistenceEngineBuilder::new(store)
    }

    /// Build an engine with the built-in managers only.
    pub fn new(store: S, config: PersistenceConfig) -> Result<Self> {
        Self::builder(store).config(config).build()
    }

    /// Open a new session (one unit of work).
    pub fn open_session(&self) -> Session<S> {
        self.factory.open()
    }

    /// Open a session with a one-off configuration.
    pub fn open_session_with(&self, config: SessionConfig) -> Session<S> {
        self.factory.open_with(config)
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn registry(&self) -> &CollectionRegistry<S> {
        self.factory.registry()
    }

    /// The store all sessions write to.
    pub fn store(&self) -> &S {
        self.factory.registry().store()
    }

    /// Session factory sharing this engine's registry.
    pub fn session_factory(&self) -> SessionFactory<S> {
        self.factory.clone()
    }
}

impl<S: DocumentStore> fmt::Debug for PersistenceEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceEngine")
            .field("config", &self.config)
            .field("collections", &self.registry().collections())
            .finish()
    }
}

/// Builder for [`PersistenceEngine`].
///
/// The `variables` manager is always registered; further managers are added
/// with [`register`](Self::register).
pub struct PersistenceEngineBuilder<S: DocumentStore> {
    store: S,
    config: PersistenceConfig,
    managers: Vec<(Arc<dyn EntityManager>, Vec<String>)>,
}

impl<S: DocumentStore> PersistenceEngineBuilder<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: PersistenceConfig::default(),
            managers: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: PersistenceConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.config = self.config.database_name(name);
        self
    }

    #[must_use]
    pub fn collection_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config = self.config.collection_prefix(prefix);
        self
    }

    #[must_use]
    pub fn session_config(mut self, session: SessionConfig) -> Self {
        self.config = self.config.session(session);
        self
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config = self.config.flush_mode(mode);
        self
    }

    /// Register the manager of an additional collection.
    #[must_use]
    pub fn register(self, manager: Arc<dyn EntityManager>) -> Self {
        self.register_with_dependencies(manager, &[])
    }

    /// Register a manager and the collections its entities reference.
    #[must_use]
    pub fn register_with_dependencies(
        mut self,
        manager: Arc<dyn EntityManager>,
        depends_on: &[&str],
    ) -> Self {
        let depends_on = depends_on.iter().map(|s| (*s).to_string()).collect();
        self.managers.push((manager, depends_on));
        self
    }

    /// Validate the configuration and register every manager.
    ///
    /// Fails with a configuration error on an invalid database name, prefix
    /// or collection name, and when a collection is registered twice
    /// (including `variables`).
    pub fn build(self) -> Result<PersistenceEngine<S>> {
        self.config.validate()?;

        let mut registry =
            CollectionRegistry::new(self.store).with_prefix(self.config.collection_prefix.clone());
        registry.register(Arc::new(VariableInstanceManager::new()))?;
        for (manager, depends_on) in self.managers {
            let depends_on: Vec<&str> = depends_on.iter().map(String::as_str).collect();
            registry.register_with_dependencies(manager, &depends_on)?;
        }

        tracing::info!(
            database = %self.config.database_name,
            prefix = %self.config.collection_prefix,
            collections = ?registry.collections(),
            "Persistence engine ready"
        );

        let factory = SessionFactory::with_config(registry, self.config.session.clone());
        Ok(PersistenceEngine {
            config: self.config,
            factory,
        })
    }
}

impl<S: DocumentStore> fmt::Debug for PersistenceEngineBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceEngineBuilder")
            .field("config", &self.config)
            .field("managers", &self.managers.len())
            .finish_non_exhaustive()
    }
}
