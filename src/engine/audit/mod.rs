//! Chronicle Audit Module
//!
//! Snapshot capture on commit, append-only history and rollback

pub mod interceptor;
pub mod model;
pub mod registry;
pub mod rollback;
pub mod serializer;
pub mod store;

pub use interceptor::ChangeInterceptor;
pub use model::{AuditLog, AuditLogId, ChangeKind, EntityFields, FieldValue, Snapshot, SnapshotId, SnapshotSummary, StoreStats};
pub use registry::{AuditedEntity, EntityRegistry, RegistryEntry};
pub use rollback::{RollbackEngine, RollbackOptions, RollbackOutcome, RollbackTarget};
pub use serializer::{CapturedState, SnapshotSerializer};
pub use store::SnapshotStore;
