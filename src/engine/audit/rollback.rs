//! Rollback Engine
//!
//! Restores an entity to a recorded snapshot by writing the snapshot's
//! fields back through the host's own write path. The restore is a normal
//! unit of work, so it is audited like any other change.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::interceptor::ChangeInterceptor;
use super::model::{AuditLogId, ChangeKind, EntityFields, FieldValue, Snapshot, SnapshotId};
use super::registry::RegistryEntry;
use super::serializer::SnapshotSerializer;
use super::store::SnapshotStore;
use crate::engine::entity::{Auditable, EntityRepository};
use crate::engine::error::{AuditError, Result};
use crate::engine::unit_of_work::UnitOfWork;

/// Which snapshot to restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTarget {
    Snapshot(SnapshotId),
    /// The snapshot recorded just before the most recent one
    Previous,
}

impl fmt::Display for RollbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackTarget::Snapshot(id) => write!(f, "{}", id),
            RollbackTarget::Previous => f.write_str("previous"),
        }
    }
}

impl FromStr for RollbackTarget {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("previous") {
            return Ok(RollbackTarget::Previous);
        }
        s.parse::<SnapshotId>()
            .map(RollbackTarget::Snapshot)
            .map_err(|_| AuditError::SnapshotNotFound(format!("not a snapshot id: {}", s)))
    }
}

impl From<SnapshotId> for RollbackTarget {
    fn from(id: SnapshotId) -> Self {
        RollbackTarget::Snapshot(id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOptions {
    /// Apply the snapshot's deletion marker too. When false the live
    /// entity keeps its current marker.
    pub restore_deletion_state: bool,
    /// Fail unless the live entity is still at this version
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub restored_from: SnapshotId,
    pub audit_log_id: AuditLogId,
}

pub struct RollbackEngine {
    interceptor: Arc<ChangeInterceptor>,
    repository: Arc<dyn EntityRepository>,
    store: SnapshotStore,
    serializer: SnapshotSerializer,
}

impl RollbackEngine {
    pub fn new(interceptor: Arc<ChangeInterceptor>, repository: Arc<dyn EntityRepository>) -> Self {
        Self {
            interceptor,
            repository,
            store: SnapshotStore::new(),
            serializer: SnapshotSerializer::new(),
        }
    }

    pub fn rollback(
        &self,
        conn: &mut Connection,
        entity_type: &str,
        entity_id: &str,
        target: RollbackTarget,
    ) -> Result<RollbackOutcome> {
        self.rollback_with(conn, entity_type, entity_id, target, RollbackOptions::default())
    }

    pub fn rollback_with(
        &self,
        conn: &mut Connection,
        entity_type: &str,
        entity_id: &str,
        target: RollbackTarget,
        options: RollbackOptions,
    ) -> Result<RollbackOutcome> {
        let registry = self.interceptor.registry();
        let entry = registry.resolve(entity_type)?;

        let mut uow = UnitOfWork::begin_immediate(conn)?.with_interceptor(self.interceptor.clone());

        let snapshot = self.resolve_target(uow.connection(), entity_type, entity_id, target)?;

        let mut entity = self
            .repository
            .load(uow.connection(), entity_type, entity_id)?
            .ok_or_else(|| AuditError::entity_not_found(entity_type, entity_id))?;

        if snapshot.entity_id != entity_id {
            return Err(AuditError::SnapshotNotFound(format!(
                "snapshot {} belongs to {} {}, not {}",
                snapshot.id, snapshot.entity_type, snapshot.entity_id, entity_id
            )));
        }

        let loaded_version = entity.version();
        if let Some(expected) = options.expected_version {
            if loaded_version != Some(expected) {
                return Err(AuditError::concurrent_modification(
                    entity_type,
                    entity_id,
                    format!("expected version {}, found {}", expected, describe_version(loaded_version)),
                ));
            }
        }

        let mut fields = self.serializer.decode(&snapshot.payload)?;
        if !options.restore_deletion_state {
            keep_live_marker(&self.serializer, entry, &*entity, &mut fields)?;
        }
        entry.apply(entity.as_mut(), &fields)?;

        self.repository.store(uow.connection(), &*entity, loaded_version)?;
        uow.track(entity, ChangeKind::Modified);

        let receipt = uow.commit()?;
        let audit_log_id = receipt
            .audit_logs
            .first()
            .copied()
            .ok_or_else(|| AuditError::InvalidAuditLog(format!("rollback of {} {} was not recorded", entity_type, entity_id)))?;

        tracing::info!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            restored_from = %snapshot.id,
            audit_log_id = %audit_log_id,
            "rolled back entity"
        );

        Ok(RollbackOutcome {
            restored_from: snapshot.id,
            audit_log_id,
        })
    }

    fn resolve_target(
        &self,
        conn: &Connection,
        entity_type: &str,
        entity_id: &str,
        target: RollbackTarget,
    ) -> Result<Snapshot> {
        match target {
            RollbackTarget::Snapshot(id) => {
                let snapshot = self.store.get(conn, id)?;
                if snapshot.entity_type != entity_type {
                    return Err(AuditError::SnapshotNotFound(format!(
                        "snapshot {} belongs to {}, not {}",
                        id, snapshot.entity_type, entity_type
                    )));
                }
                Ok(snapshot)
            }
            RollbackTarget::Previous => self
                .store
                .previous(conn, entity_type, entity_id)?
                .ok_or_else(|| AuditError::SnapshotNotFound(format!("no previous snapshot of {} {}", entity_type, entity_id))),
        }
    }
}

/// Overwrite the snapshot's deletion marker with the live entity's value.
fn keep_live_marker(
    serializer: &SnapshotSerializer,
    entry: &RegistryEntry,
    live: &dyn Auditable,
    fields: &mut EntityFields,
) -> Result<()> {
    let Some(marker) = entry.deletion_marker() else {
        return Ok(());
    };
    let mut live_state = serializer.capture(live, entry)?;
    let current = live_state.fields.remove(marker).unwrap_or(FieldValue::Null);
    if !current.is_null() {
        tracing::debug!(
            entity_type = %entry.type_name(),
            entity_id = %live_state.entity_id,
            marker = %marker,
            "keeping live deletion marker"
        );
    }
    fields.insert(marker.to_string(), current);
    Ok(())
}

fn describe_version(version: Option<i64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "none".into(),
    }
}
