//! flowdoc - document-store persistence for a process engine.
//!
//! A process engine built for transactional, relational storage expects
//! atomic multi-entity commits, query caches that follow in-flight changes,
//! and dirty tracking of loaded entities. flowdoc provides those on top of a
//! schemaless document store through a per-transaction unit of work:
//!
//! - One in-memory instance per stored entity (identity map)
//! - Buffered inserts, updates and deletes with merge rules
//! - Query results cached and invalidated by matchers
//! - A single ordered, best-effort flush with partial-failure reporting
//!
//! # Quick Start
//!
//! ```ignore
//! use flowdoc::prelude::*;
//!
//! async fn set_variable(cx: &Cx, engine: &PersistenceEngine<MemoryStore>) -> Result<()> {
//!     let mut session = engine.open_session();
//!     let mut variables = Variables::new(&mut session);
//!
//!     variables.create(VariableInstance::new("amount").execution_id("e1").long(10))?;
//!     let all = variables.find_by_execution_id(cx, "e1").await; // includes the new one
//!
//!     match session.flush(cx).await {
//!         Outcome::Ok(result) => tracing::info!(writes = result.total(), "committed"),
//!         Outcome::Err(Error::FlushPartialFailure(report)) => {
//!             // `report.succeeded` are in the store, `report.failed` are not.
//!         }
//!         _ => {}
//!     }
//!     session.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod variables;

pub use config::{DEFAULT_DATABASE_NAME, PersistenceConfig};
pub use engine::{PersistenceEngine, PersistenceEngineBuilder};
pub use variables::{
    COLLECTION_VARIABLES, VALUE_FIELDS, VariableInstance, VariableInstanceManager, Variables,
};

pub use flowdoc_core::{
    CacheMatcher, ChangeEvent, Cx, Document, DocumentManager, DocumentStore, Entity,
    EntityErrorKind, EntityId, EntityManager, EntityRef, Error, FailedWrite, FieldEquals, Filter,
    FlushPartialFailure, ID_FIELD, Intent, Outcome, Result, SessionErrorKind, StoreError,
    StoreErrorKind, Value, WriteRecord, document_id, read_entity, write_entity,
};

pub use flowdoc_session::{
    CollectionRegistry, FindOptions, FlushMode, FlushResult, PendingCounts, Session, SessionConfig,
    SessionDebugInfo, SessionEvent, SessionFactory, SessionState, SessionStats,
};

pub use flowdoc_memory::{MemoryStore, WriteEntry, WriteOp};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use flowdoc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Cx, Document, DocumentManager, DocumentStore, Entity, EntityId, EntityManager, EntityRef,
        Error, FieldEquals, Filter, FindOptions, FlushMode, MemoryStore, Outcome,
        PersistenceConfig, PersistenceEngine, Result, Session, SessionConfig, VariableInstance,
        Variables, read_entity, write_entity,
    };
}
