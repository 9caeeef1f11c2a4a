//! Flush operation ordering and execution for flowdoc sessions.
//!
//! This module turns the tracked changes of a session into store writes and
//! issues them in a fixed order:
//! - INSERT first, grouped by collection, parent collections first
//! - UPDATE next, in tracking order
//! - DELETE last, in tracking order, child collections first
//!
//! The store has no multi-document transactions. Every write is issued on its
//! own and nothing is rolled back; a flush in which any write fails reports a
//! [`FlushPartialFailure`] naming exactly what was and was not applied.

use crate::change_tracker::PendingChange;
use crate::identity_map::EntityKey;
use crate::registry::CollectionRegistry;
use flowdoc_core::{
    Cx, Document, DocumentStore, Error, FailedWrite, FlushPartialFailure, Intent, Outcome, Result,
    WriteRecord, read_entity,
};
use std::collections::HashMap;

/// A pending store write.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert a full document.
    Insert {
        key: EntityKey,
        /// Serialized entity, `_id` included.
        document: Document,
    },
    /// Overwrite some fields of an existing document.
    Update {
        key: EntityKey,
        /// Changed fields only.
        changes: Document,
    },
    /// Delete an existing document.
    Delete { key: EntityKey },
}

impl PendingOp {
    /// Logical collection of the write.
    pub fn collection(&self) -> &str {
        &self.key().collection
    }

    pub fn key(&self) -> &EntityKey {
        match self {
            PendingOp::Insert { key, .. } => key,
            PendingOp::Update { key, .. } => key,
            PendingOp::Delete { key } => key,
        }
    }

    pub fn intent(&self) -> Intent {
        match self {
            PendingOp::Insert { .. } => Intent::Inserted,
            PendingOp::Update { .. } => Intent::Updated,
            PendingOp::Delete { .. } => Intent::Deleted,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }

    /// Identification of this write for reporting.
    pub fn record(&self) -> WriteRecord {
        let key = self.key();
        WriteRecord {
            collection: key.collection.clone(),
            id: key.id.clone(),
            intent: self.intent(),
        }
    }
}

/// Store writes produced from a session's pending changes.
#[derive(Debug, Default)]
pub struct SerializedChanges {
    pub ops: Vec<PendingOp>,
    /// Tracked updates whose manager wrote no field. They are never issued.
    pub unwritten: Vec<WriteRecord>,
}

/// Serialize pending changes into store writes.
///
/// Every change goes through the manager of its collection. Serialization
/// happens up front, so a failure here means nothing is written. Updates
/// whose partial document comes out empty are not issued and are listed in
/// [`SerializedChanges::unwritten`].
#[tracing::instrument(level = "debug", skip(registry, changes))]
pub fn serialize_changes<S: DocumentStore>(
    registry: &CollectionRegistry<S>,
    changes: &[PendingChange],
) -> Result<SerializedChanges> {
    let mut ops = Vec::with_capacity(changes.len());
    let mut unwritten = Vec::new();
    for change in changes {
        let manager = registry.binding(&change.key.collection)?.manager();
        match change.intent {
            Intent::Inserted => {
                let document = manager.serialize(&read_entity(&change.entity))?;
                ops.push(PendingOp::Insert {
                    key: change.key.clone(),
                    document,
                });
            }
            Intent::Updated => {
                let changes =
                    manager.serialize_update(&read_entity(&change.entity), &change.changes)?;
                if changes.is_empty() {
                    let record = WriteRecord {
                        collection: change.key.collection.clone(),
                        id: change.key.id.clone(),
                        intent: Intent::Updated,
                    };
                    tracing::warn!(
                        write = %record,
                        fields = ?change.changes.keys().collect::<Vec<_>>(),
                        "Update has no persistable fields - not written"
                    );
                    unwritten.push(record);
                    continue;
                }
                ops.push(PendingOp::Update {
                    key: change.key.clone(),
                    changes,
                });
            }
            Intent::Deleted => ops.push(PendingOp::Delete {
                key: change.key.clone(),
            }),
            Intent::None => {}
        }
    }
    tracing::debug!(
        count = ops.len(),
        unwritten = unwritten.len(),
        "Serialized pending changes"
    );
    Ok(SerializedChanges { ops, unwritten })
}

/// What to do with the remaining writes once one write has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Attempt every write; report all failures at the end.
    #[default]
    ContinueOnError,
    /// Stop at the first failure; report the rest as skipped.
    FailFast,
}

/// Orders writes for flush.
///
/// Uses registered collection dependencies to determine ordering:
/// - Parents must be inserted before children
/// - Children must be deleted before parents
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Collection -> collections it references.
    dependencies: HashMap<String, Vec<String>>,
}

impl FlushOrderer {
    /// Create a new flush orderer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the dependencies registered in a collection registry.
    pub fn from_registry<S: DocumentStore>(registry: &CollectionRegistry<S>) -> Self {
        let mut orderer = Self::new();
        for collection in registry.collections() {
            if let Ok(binding) = registry.binding(collection) {
                if !binding.depends_on().is_empty() {
                    orderer.register_collection(collection, binding.depends_on().to_vec());
                }
            }
        }
        orderer
    }

    /// Register a collection's dependencies directly.
    pub fn register_collection(&mut self, collection: impl Into<String>, depends_on: Vec<String>) {
        self.dependencies.insert(collection.into(), depends_on);
    }

    /// Does `child` reference `parent`, directly or transitively?
    pub fn depends_on(&self, child: &str, parent: &str) -> bool {
        if child == parent {
            return false;
        }
        let mut stack = vec![child];
        let mut seen: Vec<&str> = Vec::new();
        while let Some(current) = stack.pop() {
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            for dep in self.dependencies.get(current).into_iter().flatten() {
                if dep == parent {
                    return true;
                }
                stack.push(dep.as_str());
            }
        }
        false
    }

    /// Order writes into a flush plan.
    ///
    /// `ops` must be in tracking order.
    pub fn order(&self, ops: Vec<PendingOp>) -> FlushPlan {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for op in ops {
            match op {
                PendingOp::Insert { .. } => inserts.push(op),
                PendingOp::Update { .. } => updates.push(op),
                PendingOp::Delete { .. } => deletes.push(op),
            }
        }

        FlushPlan {
            inserts: self.order_inserts(inserts),
            updates,
            deletes: self.order_deletes(deletes),
            unwritten: Vec::new(),
        }
    }

    /// Order serialized changes, keeping the updates that produced no write.
    pub fn plan(&self, serialized: SerializedChanges) -> FlushPlan {
        let mut plan = self.order(serialized.ops);
        plan.unwritten = serialized.unwritten;
        plan
    }

    /// Group by collection (first appearance), then put parents first.
    fn order_inserts(&self, inserts: Vec<PendingOp>) -> Vec<PendingOp> {
        let mut groups: Vec<(String, Vec<PendingOp>)> = Vec::new();
        for op in inserts {
            match groups.iter_mut().find(|(c, _)| c == op.collection()) {
                Some((_, group)) => group.push(op),
                None => groups.push((op.collection().to_string(), vec![op])),
            }
        }

        let mut ordered = Vec::new();
        while !groups.is_empty() {
            // First group with no remaining parent; on a cycle, take the first.
            let next = (0..groups.len())
                .find(|&i| {
                    !groups
                        .iter()
                        .any(|(other, _)| self.depends_on(&groups[i].0, other))
                })
                .unwrap_or(0);
            let (_, group) = groups.remove(next);
            ordered.extend(group);
        }
        ordered
    }

    /// Keep tracking order, except that a child's delete precedes its parent's.
    fn order_deletes(&self, mut deletes: Vec<PendingOp>) -> Vec<PendingOp> {
        if self.dependencies.is_empty() {
            return deletes;
        }
        let mut ordered = Vec::with_capacity(deletes.len());
        while !deletes.is_empty() {
            let next = (0..deletes.len())
                .find(|&i| {
                    !deletes
                        .iter()
                        .any(|other| self.depends_on(other.collection(), deletes[i].collection()))
                })
                .unwrap_or(0);
            ordered.push(deletes.remove(next));
        }
        ordered
    }
}

/// A plan for executing flush writes.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Insert writes (grouped by collection, parents first).
    pub inserts: Vec<PendingOp>,
    /// Update writes (tracking order).
    pub updates: Vec<PendingOp>,
    /// Delete writes (tracking order, children first).
    pub deletes: Vec<PendingOp>,
    /// Tracked updates that produced no write.
    pub unwritten: Vec<WriteRecord>,
}

impl FlushPlan {
    /// Create an empty flush plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the plan has any writes.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total number of writes in the plan.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// All writes in execution order.
    pub fn ops(&self) -> impl Iterator<Item = &PendingOp> {
        self.inserts
            .iter()
            .chain(self.updates.iter())
            .chain(self.deletes.iter())
    }

    /// Execute the plan against the store, one write at a time.
    ///
    /// Cancellation or panic of a store call is recorded as a failed write.
    /// Any failure turns the outcome into `Error::FlushPartialFailure`;
    /// writes that succeeded before or after it stay applied.
    #[tracing::instrument(level = "info", skip(self, cx, registry))]
    pub async fn execute<S: DocumentStore>(
        &self,
        cx: &Cx,
        registry: &CollectionRegistry<S>,
        mode: FlushMode,
    ) -> Outcome<FlushResult, Error> {
        tracing::info!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut result = FlushResult {
            unwritten: self.unwritten.clone(),
            ..FlushResult::default()
        };
        let mut report = FlushPartialFailure::default();

        for op in self.ops() {
            let record = op.record();
            if mode == FlushMode::FailFast && !report.failed.is_empty() {
                report.skipped.push(record);
                continue;
            }

            match Self::execute_op(cx, registry, op).await {
                Ok(()) => {
                    match op {
                        PendingOp::Insert { .. } => result.inserted += 1,
                        PendingOp::Update { .. } => result.updated += 1,
                        PendingOp::Delete { .. } => result.deleted += 1,
                    }
                    report.succeeded.push(record);
                }
                Err(error) => {
                    tracing::warn!(write = %record, error = %error, "Flush write failed");
                    report.failed.push(FailedWrite {
                        write: record,
                        error,
                    });
                }
            }
        }

        if report.failed.is_empty() {
            tracing::info!(
                elapsed_ms = start.elapsed().as_millis(),
                inserted = result.inserted,
                updated = result.updated,
                deleted = result.deleted,
                unwritten = result.unwritten.len(),
                "Flush complete"
            );
            Outcome::Ok(result)
        } else {
            tracing::warn!(
                elapsed_ms = start.elapsed().as_millis(),
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                skipped = report.skipped.len(),
                "Flush partially failed"
            );
            Outcome::Err(Error::FlushPartialFailure(report))
        }
    }

    /// Execute a single write, folding every non-`Ok` outcome into an error.
    #[tracing::instrument(level = "debug", skip(cx, registry, op), fields(write = %op.record()))]
    async fn execute_op<S: DocumentStore>(
        cx: &Cx,
        registry: &CollectionRegistry<S>,
        op: &PendingOp,
    ) -> std::result::Result<(), Error> {
        let handle = registry.handle(op.collection())?;
        let outcome = match op {
            PendingOp::Insert { document, .. } => handle.insert_one(cx, document.clone()).await,
            PendingOp::Update { key, changes } => {
                tracing::debug!(fields = ?changes.keys().collect::<Vec<_>>(), "Executing update");
                handle.update_by_id(cx, &key.id, changes.clone()).await
            }
            PendingOp::Delete { key } => handle.delete_by_id(cx, &key.id).await,
        };
        match outcome {
            Outcome::Ok(()) => Ok(()),
            Outcome::Err(e) => Err(e),
            Outcome::Cancelled(r) => {
                tracing::debug!(reason = ?r, "Store call cancelled");
                Err(Error::Cancelled)
            }
            Outcome::Panicked(p) => Err(Error::Custom(format!("store call panicked: {p:?}"))),
        }
    }
}

/// Result of a flush in which every write succeeded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of documents inserted.
    pub inserted: usize,
    /// Number of documents updated.
    pub updated: usize,
    /// Number of documents deleted.
    pub deleted: usize,
    /// Tracked updates that were not written because no field of them is
    /// persisted by their manager.
    pub unwritten: Vec<WriteRecord>,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of writes performed. Unwritten updates do not count.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}
