//! Error types for flowdoc operations.

use crate::document::{EntityId, Intent};
use std::fmt;

/// The primary error type for all flowdoc operations.
#[derive(Debug)]
pub enum Error {
    /// Session-tracked entity errors (duplicate, unknown, stale)
    Entity(EntityError),
    /// One or more store writes failed during flush
    FlushPartialFailure(FlushPartialFailure),
    /// Session lifecycle errors
    Session(SessionError),
    /// Errors reported by the document store
    Store(StoreError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct EntityError {
    pub kind: EntityErrorKind,
    pub collection: String,
    pub id: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityErrorKind {
    /// An entity with the same id is already present in the session
    Duplicate,
    /// The entity was never loaded or inserted in this session
    Unknown,
    /// The entity was already deleted in this session
    Stale,
    /// A change set tried to rewrite the entity id
    IdChange,
}

#[derive(Debug)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// Flush was already attempted for this session
    AlreadyFlushed,
    /// The session was closed
    Closed,
    /// No manager is registered for the collection
    UnknownCollection,
    /// A before-flush callback refused the flush
    FlushVetoed,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub collection: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Could not reach the store
    Connect,
    /// The store call timed out
    Timeout,
    /// The addressed document does not exist
    NotFound,
    /// A document with the same id already exists
    DuplicateKey,
    /// The store refused the write
    Rejected,
    /// Other store error
    Other,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Identifies one write of a flush batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub collection: String,
    pub id: EntityId,
    pub intent: Intent,
}

impl fmt::Display for WriteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.intent, self.collection, self.id)
    }
}

/// A write that the store rejected during flush.
#[derive(Debug)]
pub struct FailedWrite {
    pub write: WriteRecord,
    pub error: Error,
}

/// Outcome of a flush in which at least one write did not succeed.
///
/// Writes listed in `succeeded` are already applied to the store and are not
/// rolled back. `skipped` is only populated in fail-fast mode.
#[derive(Debug, Default)]
pub struct FlushPartialFailure {
    pub succeeded: Vec<WriteRecord>,
    pub failed: Vec<FailedWrite>,
    pub skipped: Vec<WriteRecord>,
}

impl FlushPartialFailure {
    /// Total number of writes in the batch.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }
}

impl Error {
    /// Create an entity error of the given kind.
    pub fn entity(kind: EntityErrorKind, collection: impl Into<String>, id: EntityId) -> Self {
        Error::Entity(EntityError {
            kind,
            collection: collection.into(),
            id,
        })
    }

    /// Create a session error of the given kind.
    pub fn session(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Error::Session(SessionError {
            kind,
            message: message.into(),
        })
    }

    /// Create a store error without an underlying source.
    pub fn store(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Error::Store(StoreError {
            kind,
            collection: None,
            message: message.into(),
            source: None,
        })
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Kind of the entity error, if this is one.
    pub fn entity_kind(&self) -> Option<EntityErrorKind> {
        match self {
            Error::Entity(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Kind of the session error, if this is one.
    pub fn session_kind(&self) -> Option<SessionErrorKind> {
        match self {
            Error::Session(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Kind of the store error, if this is one.
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Error::Store(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_duplicate_entity(&self) -> bool {
        self.entity_kind() == Some(EntityErrorKind::Duplicate)
    }

    pub fn is_unknown_entity(&self) -> bool {
        self.entity_kind() == Some(EntityErrorKind::Unknown)
    }

    pub fn is_stale_entity(&self) -> bool {
        self.entity_kind() == Some(EntityErrorKind::Stale)
    }

    /// The partial-failure report, if this error came out of a flush.
    pub fn as_flush_failure(&self) -> Option<&FlushPartialFailure> {
        match self {
            Error::FlushPartialFailure(f) => Some(f),
            _ => None,
        }
    }

    /// Is this a transient store error (timeout, lost connection)?
    ///
    /// The session never retries on its own; callers decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(s) => matches!(s.kind, StoreErrorKind::Connect | StoreErrorKind::Timeout),
            Error::Cancelled => true,
            _ => false,
        }
    }
}

impl StoreError {
    /// Attach the collection the failing call addressed.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

impl fmt::Display for EntityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityErrorKind::Duplicate => "duplicate entity",
            EntityErrorKind::Unknown => "entity unknown to this session",
            EntityErrorKind::Stale => "entity already deleted in this session",
            EntityErrorKind::IdChange => "entity id cannot be changed",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FlushPartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flush partially failed: {} of {} writes failed ({} succeeded, {} skipped)",
            self.failed.len(),
            self.total(),
            self.succeeded.len(),
            self.skipped.len()
        )?;
        for failed in &self.failed {
            write!(f, "; {}: {}", failed.write, failed.error)?;
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Entity(e) => write!(f, "Entity error: {} ({}/{})", e.kind, e.collection, e.id),
            Error::FlushPartialFailure(e) => write!(f, "{}", e),
            Error::Session(e) => write!(f, "Session error: {}", e.message),
            Error::Store(e) => {
                if let Some(collection) = &e.collection {
                    write!(f, "Store error in '{}': {}", collection, e.message)
                } else {
                    write!(f, "Store error: {}", e.message)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for flowdoc operations.
pub type Result<T> = std::result::Result<T, Error>;
