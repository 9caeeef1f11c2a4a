//! Change tracking and dirty detection for flowdoc sessions.
//!
//! The tracker records one intent per entity (insert, update, delete) and
//! merges successive intents on the same entity into a single pending write.
//! It also keeps load-time snapshots so that in-place mutations can be turned
//! into a changed-field set, and the last state the session tracked for each
//! entity so that cache invalidation sees where an entity came from.
//!
//! Merge rules:
//!
//! | prior      | insert     | update         | delete     |
//! |------------|------------|----------------|------------|
//! | none       | INSERTED   | UPDATED        | DELETED    |
//! | INSERTED   | duplicate  | INSERTED       | collapsed  |
//! | UPDATED    | duplicate  | field union    | DELETED    |
//! | DELETED    | stale      | stale          | stale      |
//! | collapsed  | stale      | stale          | stale      |

use crate::identity_map::EntityKey;
use flowdoc_core::{
    Document, EntityErrorKind, EntityRef, Error, ID_FIELD, Intent, Result, Value, read_entity,
};
use std::collections::{HashMap, HashSet};

/// One tracked entity.
#[derive(Debug)]
struct TrackedChange {
    intent: Intent,
    entity: EntityRef,
    /// Accumulated changed fields (UPDATED only).
    changes: Document,
}

/// A change that will become one write at flush time.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub key: EntityKey,
    pub entity: EntityRef,
    pub intent: Intent,
    /// Field-level union of all updates. Empty unless `intent` is `Updated`.
    pub changes: Document,
    /// Document as loaded from the store, if any.
    pub before: Option<Document>,
}

/// Tracks intents and snapshots for one unit of work.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: HashMap<EntityKey, TrackedChange>,
    /// Keys in first-tracked order.
    order: Vec<EntityKey>,
    /// Load-time documents by key.
    snapshots: HashMap<EntityKey, Document>,
    /// Document of each entity as of its last tracked load or change.
    states: HashMap<EntityKey, Document>,
    /// Keys deleted or collapsed in this unit of work.
    tombstones: HashSet<EntityKey>,
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with `StaleEntity` if the key was deleted in this unit of work.
    pub fn ensure_live(&self, key: &EntityKey) -> Result<()> {
        if self.tombstones.contains(key) {
            return Err(stale(key));
        }
        Ok(())
    }

    /// Was this key deleted (or collapsed) in this unit of work?
    pub fn is_deleted(&self, key: &EntityKey) -> bool {
        self.tombstones.contains(key)
    }

    /// Record a newly created entity.
    #[tracing::instrument(level = "trace", skip(self, entity))]
    pub fn mark_inserted(&mut self, key: EntityKey, entity: EntityRef) -> Result<()> {
        self.ensure_live(&key)?;
        if self.entries.contains_key(&key) {
            return Err(Error::entity(
                EntityErrorKind::Duplicate,
                key.collection.clone(),
                key.id.clone(),
            ));
        }
        tracing::trace!("Tracking insert");
        let document = read_entity(&entity).to_document();
        self.states.insert(key.clone(), document);
        self.order.push(key.clone());
        self.entries.insert(
            key,
            TrackedChange {
                intent: Intent::Inserted,
                entity,
                changes: Document::new(),
            },
        );
        Ok(())
    }

    /// Record changed fields of an entity.
    ///
    /// Returns the intent the entity is tracked with afterwards.
    #[tracing::instrument(level = "trace", skip(self, entity, changed))]
    pub fn mark_updated(
        &mut self,
        key: EntityKey,
        entity: EntityRef,
        changed: &Document,
    ) -> Result<Intent> {
        self.ensure_live(&key)?;
        if let Some(entry) = self.entries.get_mut(&key) {
            match entry.intent {
                // Fields are already folded into the entity that becomes the insert payload.
                Intent::Inserted => {}
                Intent::Updated => {
                    for (name, value) in changed {
                        entry.changes.insert(name.clone(), value.clone());
                    }
                }
                Intent::Deleted => return Err(stale(&key)),
                Intent::None => {
                    entry.intent = Intent::Updated;
                    entry.changes = changed.clone();
                }
            }
            tracing::trace!(intent = %entry.intent, fields = changed.len(), "Merged update");
            return Ok(entry.intent);
        }

        tracing::trace!(fields = changed.len(), "Tracking update");
        self.order.push(key.clone());
        self.entries.insert(
            key,
            TrackedChange {
                intent: Intent::Updated,
                entity,
                changes: changed.clone(),
            },
        );
        Ok(Intent::Updated)
    }

    /// Record a deletion.
    ///
    /// Returns `Intent::None` when the delete collapsed a pending insert; the
    /// entity is then forgotten entirely and will never be written.
    #[tracing::instrument(level = "trace", skip(self, entity))]
    pub fn mark_deleted(&mut self, key: EntityKey, entity: EntityRef) -> Result<Intent> {
        self.ensure_live(&key)?;
        self.tombstones.insert(key.clone());

        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.intent == Intent::Inserted {
                self.entries.remove(&key);
                self.order.retain(|k| k != &key);
                self.snapshots.remove(&key);
                self.states.remove(&key);
                tracing::trace!("Insert collapsed by delete");
                return Ok(Intent::None);
            }
            entry.intent = Intent::Deleted;
            entry.changes.clear();
            tracing::trace!("Update replaced by delete");
            return Ok(Intent::Deleted);
        }

        tracing::trace!("Tracking delete");
        self.order.push(key.clone());
        self.entries.insert(
            key,
            TrackedChange {
                intent: Intent::Deleted,
                entity,
                changes: Document::new(),
            },
        );
        Ok(Intent::Deleted)
    }

    /// Current intent for a key. Untracked and collapsed keys report `None`.
    pub fn intent_of(&self, key: &EntityKey) -> Intent {
        self.entries.get(key).map_or(Intent::None, |e| e.intent)
    }

    /// All pending changes, in first-tracked order.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.order
            .iter()
            .filter_map(|key| {
                let entry = self.entries.get(key)?;
                Some(PendingChange {
                    key: key.clone(),
                    entity: EntityRef::clone(&entry.entity),
                    intent: entry.intent,
                    changes: entry.changes.clone(),
                    before: self.snapshots.get(key).cloned(),
                })
            })
            .collect()
    }

    /// Pending (inserts, updates, deletes).
    pub fn pending_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for entry in self.entries.values() {
            match entry.intent {
                Intent::Inserted => counts.0 += 1,
                Intent::Updated => counts.1 += 1,
                Intent::Deleted => counts.2 += 1,
                Intent::None => {}
            }
        }
        counts
    }

    /// Keep the document an entity was loaded from.
    #[tracing::instrument(level = "trace", skip(self, document))]
    pub fn snapshot(&mut self, key: EntityKey, document: Document) {
        tracing::trace!(fields = document.len(), "Taking entity snapshot");
        self.states.insert(key.clone(), document.clone());
        self.snapshots.insert(key, document);
    }

    /// Remember the document an entity has after a tracked change.
    ///
    /// Returns the state it replaces: the document as of the previous load,
    /// insert or change of the same entity.
    pub fn record_state(&mut self, key: EntityKey, document: Document) -> Option<Document> {
        self.states.insert(key, document)
    }

    /// Document of an entity as of its last tracked load or change.
    pub fn last_state(&self, key: &EntityKey) -> Option<&Document> {
        self.states.get(key)
    }

    /// Load-time document of an entity.
    pub fn get_snapshot(&self, key: &EntityKey) -> Option<&Document> {
        self.snapshots.get(key)
    }

    /// Fields of `current` that differ from the load snapshot.
    ///
    /// Fields removed since load are reported as `null`, which the store
    /// treats as an unset. Without a snapshot
    /// every field of `current` counts as changed. `_id` is never reported.
    #[tracing::instrument(level = "debug", skip(self, current))]
    pub fn changed_fields(&self, key: &EntityKey, current: &Document) -> Document {
        let mut changed = Document::new();
        let Some(original) = self.snapshots.get(key) else {
            for (name, value) in current {
                if name != ID_FIELD {
                    changed.insert(name.clone(), value.clone());
                }
            }
            tracing::debug!(
                changed_count = changed.len(),
                "No snapshot - all fields considered changed"
            );
            return changed;
        };

        for (name, value) in current {
            if name != ID_FIELD && original.get(name) != Some(value) {
                changed.insert(name.clone(), value.clone());
            }
        }
        for name in original.keys() {
            if name != ID_FIELD && !current.contains_key(name) {
                changed.insert(name.clone(), Value::Null);
            }
        }

        tracing::debug!(
            changed_count = changed.len(),
            fields = ?changed.keys().collect::<Vec<_>>(),
            "Detected changed fields"
        );
        changed
    }

    /// Number of tracked entities with a pending intent.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all intents, snapshots, states and tombstones.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.snapshots.clear();
        self.states.clear();
        self.tombstones.clear();
    }
}

fn stale(key: &EntityKey) -> Error {
    Error::entity(
        EntityErrorKind::Stale,
        key.collection.clone(),
        key.id.clone(),
    )
}
