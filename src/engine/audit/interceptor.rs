//! Change Interceptor
//!
//! Runs once per unit of work before commit: picks out the auditable
//! mutations, snapshots each entity and writes one audit log for the pass
//! inside the unit of work's own transaction.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;

use super::model::{truncate_to_micros, AuditLog, AuditLogId, ChangeKind, Snapshot};
use super::registry::EntityRegistry;
use super::serializer::{CapturedState, SnapshotSerializer};
use super::store::SnapshotStore;
use crate::engine::error::Result;
use crate::engine::unit_of_work::{CommitInterceptor, PendingMutation};

struct Captured {
    entity_type: String,
    change: ChangeKind,
    state: CapturedState,
}

pub struct ChangeInterceptor {
    registry: Arc<EntityRegistry>,
    serializer: SnapshotSerializer,
    store: SnapshotStore,
}

impl ChangeInterceptor {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            serializer: SnapshotSerializer::new(),
            store: SnapshotStore::new(),
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Snapshot every auditable mutation in `pending` and persist them as
    /// one audit log. Returns `None` when nothing auditable was pending.
    pub fn intercept(&self, conn: &Connection, pending: &[PendingMutation]) -> Result<Option<AuditLogId>> {
        let batch = self.capture_batch(pending)?;
        if batch.is_empty() {
            return Ok(None);
        }

        let created_at = self.next_timestamp(conn, &batch)?;
        let audit_log = AuditLog::new(created_at);
        let snapshots: Vec<Snapshot> = batch
            .into_iter()
            .map(|c| Snapshot::new(&c.entity_type, &c.state.entity_id, c.change, c.state.payload, &audit_log))
            .collect();

        self.store.save_audit_log(conn, &audit_log, &snapshots)?;
        Ok(Some(audit_log.id))
    }

    /// Serialize the auditable subset of `pending`. Repeated mutations of the
    /// same entity collapse into one entry carrying the last state.
    fn capture_batch(&self, pending: &[PendingMutation]) -> Result<Vec<Captured>> {
        let mut batch: Vec<Captured> = Vec::new();
        let mut positions: HashMap<(String, String), usize> = HashMap::new();

        for mutation in pending {
            let entity = &*mutation.entity;
            let entity_type = entity.type_name();
            if !self.registry.is_registered(entity_type) {
                tracing::trace!(entity_type = %entity_type, "skipping unregistered entity type");
                continue;
            }

            let entry = self.registry.resolve(entity_type)?;
            let state = self.serializer.capture(entity, entry)?;
            let key = (entity_type.to_string(), state.entity_id.clone());

            match positions.get(&key) {
                Some(&index) => {
                    let previous = &mut batch[index];
                    previous.change = coalesce(previous.change, mutation.change);
                    previous.state = state;
                }
                None => {
                    positions.insert(key, batch.len());
                    batch.push(Captured {
                        entity_type: entity_type.to_string(),
                        change: mutation.change,
                        state,
                    });
                }
            }
        }

        Ok(batch)
    }

    /// Wall-clock time, pushed past the newest stored snapshot of any entity
    /// in the batch so per-entity history stays strictly increasing.
    fn next_timestamp(&self, conn: &Connection, batch: &[Captured]) -> Result<DateTime<Utc>> {
        let mut at = truncate_to_micros(Utc::now());
        for captured in batch {
            if let Some(latest) = self
                .store
                .latest_created_at(conn, &captured.entity_type, &captured.state.entity_id)?
            {
                if latest >= at {
                    at = latest + Duration::microseconds(1);
                }
            }
        }
        Ok(at)
    }
}

impl CommitInterceptor for ChangeInterceptor {
    fn before_commit(&self, conn: &Connection, pending: &[PendingMutation]) -> Result<Option<AuditLogId>> {
        self.intercept(conn, pending)
    }
}

/// An entity created and then edited in the same unit of work is still a
/// creation; anything else takes the later kind.
fn coalesce(earlier: ChangeKind, later: ChangeKind) -> ChangeKind {
    match (earlier, later) {
        (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
        (_, later) => later,
    }
}
