//! Variable instances.
//!
//! Process and task variables live in the `variables` collection. This module
//! provides the typed [`VariableInstance`] view, the [`VariableInstanceManager`]
//! that maps them to stored documents, and the session-scoped finders the
//! engine's variable service uses.

use flowdoc_core::{
    Cx, Document, DocumentStore, Entity, EntityId, EntityManager, EntityRef, Error, FieldEquals,
    Filter, Outcome, Result, Value, document_id,
};
use flowdoc_session::{FindOptions, Session};
use serde::{Deserialize, Serialize};

/// Logical collection holding variable instances.
pub const COLLECTION_VARIABLES: &str = "variables";

pub const FIELD_NAME: &str = "name";
pub const FIELD_TYPE_NAME: &str = "typeName";
pub const FIELD_EXECUTION_ID: &str = "executionId";
pub const FIELD_TASK_ID: &str = "taskId";
pub const FIELD_SCOPE_ID: &str = "scopeId";
pub const FIELD_SCOPE_TYPE: &str = "scopeType";
pub const FIELD_TEXT_VALUE: &str = "textValue";
pub const FIELD_TEXT_VALUE2: &str = "textValue2";
pub const FIELD_DOUBLE_VALUE: &str = "doubleValue";
pub const FIELD_LONG_VALUE: &str = "longValue";

/// Fields an update of a variable may write. Everything else is fixed once
/// the variable exists.
pub const VALUE_FIELDS: [&str; 5] = [
    FIELD_TEXT_VALUE,
    FIELD_TEXT_VALUE2,
    FIELD_DOUBLE_VALUE,
    FIELD_LONG_VALUE,
    FIELD_TYPE_NAME,
];

// ============================================================================
// Typed View
// ============================================================================

/// Typed view of a variable instance document.
///
/// The id is not part of the view; it is the id of the entity the view was
/// read from or is written into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableInstance {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_definition_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_scope_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_value2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub double_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_array_id: Option<String>,
}

impl VariableInstance {
    /// Create a variable with a name and nothing else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn process_instance_id(mut self, id: impl Into<String>) -> Self {
        self.process_instance_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    /// Bind the variable to a scope (case, plan item, ...).
    #[must_use]
    pub fn scope(mut self, scope_id: impl Into<String>, scope_type: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self.scope_type = Some(scope_type.into());
        self
    }

    /// Store a string value.
    #[must_use]
    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.type_name = Some("string".to_string());
        self.text_value = Some(value.into());
        self
    }

    /// Store an integer value.
    #[must_use]
    pub fn long(mut self, value: i64) -> Self {
        self.type_name = Some("long".to_string());
        self.long_value = Some(value);
        self
    }

    /// Store a floating point value.
    #[must_use]
    pub fn double(mut self, value: f64) -> Self {
        self.type_name = Some("double".to_string());
        self.double_value = Some(value);
        self
    }

    /// Read the typed view from an entity's fields.
    pub fn from_entity(entity: &Entity) -> Result<Self> {
        serde_json::from_value(Value::Object(entity.fields().clone()))
            .map_err(|e| Error::Serde(format!("variable {}: {}", entity.id(), e)))
    }

    /// Field set of this view, without the id.
    pub fn to_fields(&self) -> Result<Document> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(other) => Err(Error::Serde(format!(
                "variable serialized to a non-object: {}",
                other
            ))),
            Err(e) => Err(Error::Serde(e.to_string())),
        }
    }

    /// Build a new `variables` entity with a generated id.
    pub fn into_entity(self) -> Result<Entity> {
        let fields = self.to_fields()?;
        Ok(Entity::from_fields(
            COLLECTION_VARIABLES,
            EntityId::generate(),
            fields,
        ))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Entity manager of the `variables` collection.
///
/// Inserts write the whole document. Updates write only the value fields
/// ([`VALUE_FIELDS`]) that changed, taken from the entity as it is at flush
/// time; a change that touches none of them produces no write.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableInstanceManager;

impl VariableInstanceManager {
    pub fn new() -> Self {
        Self
    }
}

impl EntityManager for VariableInstanceManager {
    fn collection(&self) -> &str {
        COLLECTION_VARIABLES
    }

    fn serialize(&self, entity: &Entity) -> Result<Document> {
        VariableInstance::from_entity(entity)?;
        Ok(entity.to_document())
    }

    fn serialize_update(&self, entity: &Entity, changes: &Document) -> Result<Document> {
        let mut update = Document::new();
        for field in VALUE_FIELDS {
            if changes.contains_key(field) {
                let value = entity.get(field).cloned().unwrap_or(Value::Null);
                update.insert(field.to_string(), value);
            }
        }
        if update.len() < changes.len() {
            tracing::trace!(
                id = %entity.id(),
                changed = changes.len(),
                written = update.len(),
                "Dropping non-value fields from variable update"
            );
        }
        Ok(update)
    }

    fn deserialize(&self, document: Document) -> Result<Entity> {
        let id = document_id(&document)?;
        Ok(Entity::from_fields(COLLECTION_VARIABLES, id, document))
    }
}

/// Matcher of the by-execution query.
pub fn by_execution_id_matcher(execution_id: &str) -> FieldEquals {
    FieldEquals::new(FIELD_EXECUTION_ID, execution_id)
}

/// Cache key of the by-execution query.
pub fn by_execution_id_key(execution_id: &str) -> String {
    format!("byExecutionId:{}", execution_id)
}

/// Options that merge unflushed variables matching `filter`, without caching.
fn merging(filter: &Filter) -> FindOptions {
    let filter = filter.clone();
    FindOptions::new().matcher(move |doc: &Document| filter.matches(doc))
}

// ============================================================================
// Finders
// ============================================================================

/// Variable operations within one session.
pub struct Variables<'s, S: DocumentStore> {
    session: &'s mut Session<S>,
}

impl<'s, S: DocumentStore> Variables<'s, S> {
    pub fn new(session: &'s mut Session<S>) -> Self {
        Self { session }
    }

    /// Insert a new variable.
    pub fn create(&mut self, variable: VariableInstance) -> Result<EntityRef> {
        self.session.insert(variable.into_entity()?)
    }

    pub async fn load(&mut self, cx: &Cx, id: &EntityId) -> Outcome<Option<EntityRef>, Error> {
        self.session.load(cx, COLLECTION_VARIABLES, id).await
    }

    pub async fn find_by_task_id(&mut self, cx: &Cx, task_id: &str) -> Outcome<Vec<EntityRef>, Error> {
        let filter = Filter::eq(FIELD_TASK_ID, task_id);
        let options = merging(&filter);
        self.session
            .find(cx, COLLECTION_VARIABLES, &filter, options)
            .await
    }

    /// Variables of an execution. The result is cached for the session.
    pub async fn find_by_execution_id(
        &mut self,
        cx: &Cx,
        execution_id: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let options = FindOptions::cached(
            by_execution_id_key(execution_id),
            by_execution_id_matcher(execution_id),
        );
        self.session
            .find(
                cx,
                COLLECTION_VARIABLES,
                &Filter::eq(FIELD_EXECUTION_ID, execution_id),
                options,
            )
            .await
    }

    pub async fn find_by_execution_and_name(
        &mut self,
        cx: &Cx,
        execution_id: &str,
        name: &str,
    ) -> Outcome<Option<EntityRef>, Error> {
        let filter = Filter::and([
            Filter::eq(FIELD_EXECUTION_ID, execution_id),
            Filter::eq(FIELD_NAME, name),
        ]);
        let options = merging(&filter);
        self.session
            .find_one(cx, COLLECTION_VARIABLES, &filter, options)
            .await
    }

    pub async fn find_by_task_and_name(
        &mut self,
        cx: &Cx,
        task_id: &str,
        name: &str,
    ) -> Outcome<Option<EntityRef>, Error> {
        let filter = Filter::and([Filter::eq(FIELD_TASK_ID, task_id), Filter::eq(FIELD_NAME, name)]);
        let options = merging(&filter);
        self.session
            .find_one(cx, COLLECTION_VARIABLES, &filter, options)
            .await
    }

    pub async fn find_by_scope_id_and_scope_type(
        &mut self,
        cx: &Cx,
        scope_id: &str,
        scope_type: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let filter = Filter::and([
            Filter::eq(FIELD_SCOPE_ID, scope_id),
            Filter::eq(FIELD_SCOPE_TYPE, scope_type),
        ]);
        let options = merging(&filter);
        self.session
            .find(cx, COLLECTION_VARIABLES, &filter, options)
            .await
    }

    pub async fn find_by_scope_id_and_scope_type_and_name(
        &mut self,
        cx: &Cx,
        scope_id: &str,
        scope_type: &str,
        name: &str,
    ) -> Outcome<Option<EntityRef>, Error> {
        let filter = Filter::and([
            Filter::eq(FIELD_SCOPE_ID, scope_id),
            Filter::eq(FIELD_SCOPE_TYPE, scope_type),
            Filter::eq(FIELD_NAME, name),
        ]);
        let options = merging(&filter);
        self.session
            .find_one(cx, COLLECTION_VARIABLES, &filter, options)
            .await
    }

    /// Delete every variable of an execution. Returns the number deleted.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn delete_by_execution_id(
        &mut self,
        cx: &Cx,
        execution_id: &str,
    ) -> Outcome<usize, Error> {
        let variables = match self.find_by_execution_id(cx, execution_id).await {
            Outcome::Ok(variables) => variables,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        for variable in &variables {
            if let Err(e) = self.session.delete(COLLECTION_VARIABLES, variable) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(variables.len())
    }
}
