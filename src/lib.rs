//! Chronicle - entity change auditing and rollback
//!
//! Every unit of work that touches a registered entity type leaves an
//! append-only trail of snapshots, grouped into one audit log per commit.
//! Any recorded snapshot can be reapplied through the host's own write path;
//! that rollback is itself audited.
//!
//! ```no_run
//! # use chronicle::{Chronicle, Database, EntityRegistry};
//! # use chronicle::engine::entity::EntityRepository;
//! # use std::sync::Arc;
//! # fn demo(repository: Arc<dyn EntityRepository>) -> chronicle::Result<()> {
//! let db = Database::in_memory()?;
//! let registry = EntityRegistry::new();
//! let chronicle = Chronicle::new(db, registry, repository);
//!
//! let mut conn = chronicle.connection()?;
//! let uow = chronicle.begin(&mut conn)?;
//! // host writes through uow.connection(), then uow.modified(entity)
//! uow.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod engine;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

pub use engine::audit::{
    AuditLog, AuditLogId, AuditedEntity, ChangeInterceptor, ChangeKind, EntityFields, EntityRegistry, FieldValue,
    RollbackEngine, RollbackOptions, RollbackOutcome, RollbackTarget, Snapshot, SnapshotId, SnapshotStore,
    SnapshotSummary, StoreStats,
};
pub use engine::config::Config;
pub use engine::database::{Database, DbConnection};
pub use engine::entity::{AsAny, Auditable, EntityRepository};
pub use engine::error::{AuditError, Result};
pub use engine::unit_of_work::{CommitReceipt, UnitOfWork};

/// One audited database: storage, registered entity types, the commit-time
/// interceptor and the rollback path, wired together.
pub struct Chronicle {
    db: Database,
    interceptor: Arc<ChangeInterceptor>,
    rollback: RollbackEngine,
    store: SnapshotStore,
    restore_deletion_state: bool,
}

impl Chronicle {
    pub fn new(db: Database, registry: EntityRegistry, repository: Arc<dyn EntityRepository>) -> Self {
        let interceptor = Arc::new(ChangeInterceptor::new(Arc::new(registry)));
        let rollback = RollbackEngine::new(interceptor.clone(), repository);
        Self {
            db,
            interceptor,
            rollback,
            store: SnapshotStore::new(),
            restore_deletion_state: false,
        }
    }

    /// Open the project's database as described by its config file
    pub fn open(
        project_dir: &Path,
        config: &Config,
        registry: EntityRegistry,
        repository: Arc<dyn EntityRepository>,
    ) -> Result<Self> {
        let db = Database::with_config(&config.database_path(project_dir), &config.database)?;
        Ok(Self::new(db, registry, repository).with_rollback_defaults(config))
    }

    /// Take rollback defaults from `config`
    pub fn with_rollback_defaults(mut self, config: &Config) -> Self {
        self.restore_deletion_state = config.rollback.restore_deletion_state;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &EntityRegistry {
        self.interceptor.registry()
    }

    pub fn interceptor(&self) -> Arc<ChangeInterceptor> {
        self.interceptor.clone()
    }

    pub fn connection(&self) -> Result<DbConnection> {
        Ok(self.db.get_connection()?)
    }

    /// Start a unit of work that is audited on commit
    pub fn begin<'c>(&self, conn: &'c mut Connection) -> Result<UnitOfWork<'c>> {
        Ok(UnitOfWork::begin(conn)?.with_interceptor(self.interceptor.clone()))
    }

    /// Default options for [`Chronicle::rollback`]
    pub fn rollback_options(&self) -> RollbackOptions {
        RollbackOptions {
            restore_deletion_state: self.restore_deletion_state,
            expected_version: None,
        }
    }

    pub fn rollback(&self, entity_type: &str, entity_id: &str, target: RollbackTarget) -> Result<RollbackOutcome> {
        self.rollback_with(entity_type, entity_id, target, self.rollback_options())
    }

    pub fn rollback_with(
        &self,
        entity_type: &str,
        entity_id: &str,
        target: RollbackTarget,
        options: RollbackOptions,
    ) -> Result<RollbackOutcome> {
        let mut conn = self.connection()?;
        self.rollback.rollback_with(&mut conn, entity_type, entity_id, target, options)
    }

    pub fn history(&self, entity_type: &str, entity_id: &str) -> Result<Vec<SnapshotSummary>> {
        let conn = self.connection()?;
        self.store.history(&conn, entity_type, entity_id)
    }

    pub fn list_by_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Snapshot>> {
        let conn = self.connection()?;
        self.store.list_by_entity(&conn, entity_type, entity_id)
    }

    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Result<Snapshot> {
        let conn = self.connection()?;
        self.store.get(&conn, snapshot_id)
    }

    pub fn audit_log(&self, audit_log_id: AuditLogId) -> Result<(AuditLog, Vec<Snapshot>)> {
        let conn = self.connection()?;
        self.store.get_audit_log(&conn, audit_log_id)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.connection()?;
        self.store.stats(&conn)
    }
}
