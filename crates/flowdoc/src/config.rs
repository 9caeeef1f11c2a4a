//! Persistence configuration.

use flowdoc_core::{Error, Result};
use flowdoc_session::{FlushMode, SessionConfig};

/// Database used when none is configured.
pub const DEFAULT_DATABASE_NAME: &str = "flowdoc";

/// Characters a database name may not contain.
const FORBIDDEN_DATABASE_CHARS: &[char] = &['/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|', '?'];

/// Configuration of a [`PersistenceEngine`](crate::PersistenceEngine).
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Name of the database holding the engine's collections.
    pub database_name: String,
    /// Prefix applied to every store-side collection name.
    pub collection_prefix: String,
    /// Configuration of every session the engine opens.
    pub session: SessionConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            collection_prefix: String::new(),
            session: SessionConfig::default(),
        }
    }
}

impl PersistenceConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database name (builder pattern).
    #[must_use]
    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    /// Set the collection prefix (builder pattern).
    #[must_use]
    pub fn collection_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.collection_prefix = prefix.into();
        self
    }

    /// Replace the session configuration (builder pattern).
    #[must_use]
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Set the flush mode of every session (builder pattern).
    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.session = self.session.flush_mode(mode);
        self
    }

    /// Enable or disable the query cache of every session (builder pattern).
    #[must_use]
    pub fn enable_query_cache(mut self, value: bool) -> Self {
        self.session = self.session.enable_query_cache(value);
        self
    }

    /// Check the configuration before any collection is registered.
    pub fn validate(&self) -> Result<()> {
        if self.database_name.is_empty() {
            return Err(Error::config("database name must not be empty"));
        }
        if let Some(c) = self
            .database_name
            .chars()
            .find(|c| FORBIDDEN_DATABASE_CHARS.contains(c))
        {
            return Err(Error::config(format!(
                "database name '{}' contains forbidden character '{}'",
                self.database_name, c
            )));
        }
        if self
            .collection_prefix
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(Error::config(format!(
                "invalid collection prefix '{}'",
                self.collection_prefix
            )));
        }
        Ok(())
    }
}
