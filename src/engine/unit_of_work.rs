//! Unit of Work
//!
//! The host's atomic scope: one SQLite transaction plus the list of entity
//! mutations made inside it. Registered interceptors run against that list
//! right before `COMMIT`; if any of them fails, nothing is committed.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::fmt;
use std::sync::Arc;

use super::audit::model::{AuditLogId, ChangeKind};
use super::entity::Auditable;
use super::error::Result;

/// One tracked entity mutation. For `Deleted` the entity holds its last
/// state before deletion.
pub struct PendingMutation {
    pub entity: Box<dyn Auditable>,
    pub change: ChangeKind,
}

impl fmt::Debug for PendingMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMutation")
            .field("entity_type", &self.entity.type_name())
            .field("entity_id", &self.entity.identifier())
            .field("change", &self.change)
            .finish()
    }
}

/// Hook invoked once per unit of work before commit. Returning an error
/// aborts the unit of work.
pub trait CommitInterceptor: Send + Sync {
    fn before_commit(&self, conn: &Connection, pending: &[PendingMutation]) -> Result<Option<AuditLogId>>;
}

/// What a successful commit produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReceipt {
    pub mutations: usize,
    pub audit_logs: Vec<AuditLogId>,
}

pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
    pending: Vec<PendingMutation>,
    interceptors: Vec<Arc<dyn CommitInterceptor>>,
}

impl<'conn> UnitOfWork<'conn> {
    /// Start a deferred transaction
    pub fn begin(conn: &'conn mut Connection) -> Result<Self> {
        Self::begin_with(conn, TransactionBehavior::Deferred)
    }

    /// Start a transaction that takes the write lock up front
    pub fn begin_immediate(conn: &'conn mut Connection) -> Result<Self> {
        Self::begin_with(conn, TransactionBehavior::Immediate)
    }

    fn begin_with(conn: &'conn mut Connection, behavior: TransactionBehavior) -> Result<Self> {
        let tx = Transaction::new(conn, behavior)?;
        Ok(Self {
            tx,
            pending: Vec::new(),
            interceptors: Vec::new(),
        })
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommitInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Connection bound to this unit of work's transaction. Host entity
    /// writes must go through it.
    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    pub fn track(&mut self, entity: Box<dyn Auditable>, change: ChangeKind) {
        tracing::trace!(
            entity_type = %entity.type_name(),
            entity_id = %entity.identifier(),
            change = %change,
            "tracked mutation"
        );
        self.pending.push(PendingMutation { entity, change });
    }

    pub fn created<T: Auditable>(&mut self, entity: T) {
        self.track(Box::new(entity), ChangeKind::Created);
    }

    pub fn modified<T: Auditable>(&mut self, entity: T) {
        self.track(Box::new(entity), ChangeKind::Modified);
    }

    /// Track a deletion with the entity's pre-deletion state
    pub fn deleted<T: Auditable>(&mut self, entity: T) {
        self.track(Box::new(entity), ChangeKind::Deleted);
    }

    pub fn pending(&self) -> &[PendingMutation] {
        &self.pending
    }

    /// Run every interceptor, then commit. Any error rolls the whole
    /// transaction back, entity writes included.
    pub fn commit(self) -> Result<CommitReceipt> {
        let mut receipt = CommitReceipt {
            mutations: self.pending.len(),
            audit_logs: Vec::new(),
        };

        for interceptor in &self.interceptors {
            match interceptor.before_commit(&self.tx, &self.pending) {
                Ok(Some(audit_log_id)) => receipt.audit_logs.push(audit_log_id),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "interceptor failed, rolling back unit of work");
                    if let Err(cleanup) = self.tx.rollback() {
                        tracing::error!(error = %cleanup, "rollback after interceptor failure failed");
                    }
                    return Err(e);
                }
            }
        }

        self.tx.commit()?;
        Ok(receipt)
    }

    /// Discard every write made in this unit of work
    pub fn abort(self) -> Result<()> {
        tracing::debug!(mutations = self.pending.len(), "aborting unit of work");
        self.tx.rollback()?;
        Ok(())
    }
}
