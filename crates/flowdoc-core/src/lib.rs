//! Core types and traits for flowdoc.
//!
//! This crate provides the foundations the session layer is built on:
//!
//! - `Entity`, `EntityId` and `Document` for schemaless records
//! - `Filter` for store-level queries
//! - `DocumentStore` trait for the backing store
//! - `EntityManager` trait for per-collection (de)serialization
//! - `CacheMatcher` for query-cache membership predicates
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod document;
pub mod error;
pub mod filter;
pub mod manager;
pub mod matcher;
pub mod store;

pub use document::{
    Document, Entity, EntityId, EntityRef, ID_FIELD, Intent, Value, read_entity, write_entity,
};
pub use error::{
    ConfigError, EntityError, EntityErrorKind, Error, FailedWrite, FlushPartialFailure, Result,
    SessionError, SessionErrorKind, StoreError, StoreErrorKind, WriteRecord,
};
pub use filter::Filter;
pub use manager::{DocumentManager, EntityManager, document_id};
pub use matcher::{CacheMatcher, ChangeEvent, FieldEquals};
pub use store::DocumentStore;
