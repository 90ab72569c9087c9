//! Host Entity Capabilities
//!
//! What the engine needs from a host entity and from the host's persistence
//! layer. Everything entity-specific beyond this lives in the registry.

use rusqlite::Connection;
use std::any::Any;

use super::error::Result;

/// Object-safe access to the concrete type behind a `dyn Auditable`.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Capability every audited entity exposes.
pub trait Auditable: AsAny {
    /// Stable identifier, unique within the entity's type
    fn identifier(&self) -> String;

    /// Registered type name, e.g. `"Post"`
    fn type_name(&self) -> &str;

    /// Row version used for optimistic concurrency, if the host tracks one
    fn version(&self) -> Option<i64> {
        None
    }
}

/// Host read/write path used by rollback.
///
/// Both methods run on the connection of the caller's unit of work, so the
/// write and the audit record it triggers commit together.
pub trait EntityRepository: Send + Sync {
    /// Load the live entity, or `None` if no row exists for `id`.
    fn load(&self, conn: &Connection, type_name: &str, id: &str) -> Result<Option<Box<dyn Auditable>>>;

    /// Persist `entity`. When `expected_version` is set the write must be a
    /// compare-and-swap on the version column and fail with
    /// `AuditError::ConcurrentModification` if no row matched.
    fn store(&self, conn: &Connection, entity: &dyn Auditable, expected_version: Option<i64>) -> Result<()>;
}

/// Downcast helper shared by the registry and the rollback path.
pub(crate) fn downcast_ref<T: 'static>(entity: &dyn Auditable) -> Option<&T> {
    entity.as_any().downcast_ref::<T>()
}

pub(crate) fn downcast_mut<T: 'static>(entity: &mut dyn Auditable) -> Option<&mut T> {
    entity.as_any_mut().downcast_mut::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag {
        id: u32,
    }

    impl Auditable for Tag {
        fn identifier(&self) -> String {
            self.id.to_string()
        }

        fn type_name(&self) -> &str {
            "Tag"
        }
    }

    #[test]
    fn test_downcast_through_trait_object() {
        let mut boxed: Box<dyn Auditable> = Box::new(Tag { id: 3 });
        assert_eq!(downcast_ref::<Tag>(boxed.as_ref()).map(|t| t.id), Some(3));
        assert!(downcast_ref::<String>(boxed.as_ref()).is_none());

        if let Some(tag) = downcast_mut::<Tag>(boxed.as_mut()) {
            tag.id = 4;
        }
        assert_eq!(boxed.identifier(), "4");
        assert_eq!(boxed.version(), None);
    }
}
