//! Entity Registry
//!
//! Maps a type name to the functions that identify, capture and restore an
//! entity of that type. Nothing else in the engine knows concrete entity
//! types; everything goes through an entry resolved here.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::model::EntityFields;
use crate::engine::entity::{downcast_mut, downcast_ref, Auditable};
use crate::engine::error::{AuditError, Result};

type IdentifyFn = dyn Fn(&dyn Auditable) -> Result<String> + Send + Sync;
type CaptureFn = dyn Fn(&dyn Auditable) -> Result<EntityFields> + Send + Sync;
type ApplyFn = dyn Fn(&mut dyn Auditable, &EntityFields) -> Result<()> + Send + Sync;

/// Entity types that describe their own snapshot mapping.
pub trait AuditedEntity: Auditable + Sized {
    const TYPE_NAME: &'static str;

    /// Soft-delete field, if the type has one
    const DELETION_MARKER: Option<&'static str> = None;

    fn capture_fields(&self) -> Result<EntityFields>;

    fn apply_fields(&mut self, fields: &EntityFields) -> Result<()>;
}

/// Registered logic for one entity type
pub struct RegistryEntry {
    type_name: String,
    identify: Arc<IdentifyFn>,
    capture: Arc<CaptureFn>,
    apply: Arc<ApplyFn>,
    deletion_marker: Option<String>,
}

impl RegistryEntry {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn deletion_marker(&self) -> Option<&str> {
        self.deletion_marker.as_deref()
    }

    /// Name the field that carries the soft-delete marker
    pub fn with_deletion_marker(&mut self, field: &str) -> &mut Self {
        self.deletion_marker = Some(field.to_string());
        self
    }

    pub fn identify(&self, entity: &dyn Auditable) -> Result<String> {
        (self.identify)(entity)
    }

    pub fn capture(&self, entity: &dyn Auditable) -> Result<EntityFields> {
        (self.capture)(entity)
    }

    pub fn apply(&self, entity: &mut dyn Auditable, fields: &EntityFields) -> Result<()> {
        (self.apply)(entity, fields)
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("type_name", &self.type_name)
            .field("deletion_marker", &self.deletion_marker)
            .finish_non_exhaustive()
    }
}

/// Registry of auditable entity types
#[derive(Default, Debug)]
pub struct EntityRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `type_name`. Re-registering a name replaces the
    /// previous entry.
    pub fn register<T, I, C, A>(&mut self, type_name: &str, identify: I, capture: C, apply: A) -> &mut RegistryEntry
    where
        T: 'static,
        I: Fn(&T) -> String + Send + Sync + 'static,
        C: Fn(&T) -> Result<EntityFields> + Send + Sync + 'static,
        A: Fn(&mut T, &EntityFields) -> Result<()> + Send + Sync + 'static,
    {
        let name = type_name.to_string();

        let identify_name = name.clone();
        let erased_identify = move |entity: &dyn Auditable| -> Result<String> {
            downcast_ref::<T>(entity)
                .map(|typed| identify(typed))
                .ok_or_else(|| type_mismatch::<T>(&identify_name))
        };

        let capture_name = name.clone();
        let erased_capture = move |entity: &dyn Auditable| -> Result<EntityFields> {
            let typed = downcast_ref::<T>(entity).ok_or_else(|| type_mismatch::<T>(&capture_name))?;
            capture(typed)
        };

        let apply_name = name.clone();
        let erased_apply = move |entity: &mut dyn Auditable, fields: &EntityFields| -> Result<()> {
            let typed = downcast_mut::<T>(entity).ok_or_else(|| type_mismatch::<T>(&apply_name))?;
            apply(typed, fields)
        };

        let entry = RegistryEntry {
            type_name: name.clone(),
            identify: Arc::new(erased_identify),
            capture: Arc::new(erased_capture),
            apply: Arc::new(erased_apply),
            deletion_marker: None,
        };

        match self.entries.entry(name) {
            Entry::Occupied(mut occupied) => {
                tracing::warn!(entity_type = %occupied.key(), "replacing existing registry entry");
                occupied.insert(entry);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(entity_type = %vacant.key(), "registered auditable entity type");
                vacant.insert(entry)
            }
        }
    }

    /// Register a type that implements [`AuditedEntity`]
    pub fn register_entity<T: AuditedEntity>(&mut self) -> &mut RegistryEntry {
        let entry = self.register::<T, _, _, _>(
            T::TYPE_NAME,
            |e: &T| e.identifier(),
            |e: &T| e.capture_fields(),
            |e: &mut T, fields: &EntityFields| e.apply_fields(fields),
        );
        if let Some(marker) = T::DELETION_MARKER {
            entry.with_deletion_marker(marker);
        }
        entry
    }

    pub fn resolve(&self, type_name: &str) -> Result<&RegistryEntry> {
        self.entries
            .get(type_name)
            .ok_or_else(|| AuditError::UnknownEntityType(type_name.to_string()))
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn type_mismatch<T>(type_name: &str) -> AuditError {
    AuditError::SerializationFailure(format!(
        "entity registered as {} is not a {}",
        type_name,
        std::any::type_name::<T>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::audit::model::FieldValue;

    struct Tag {
        id: u32,
        label: String,
    }

    impl Auditable for Tag {
        fn identifier(&self) -> String {
            self.id.to_string()
        }

        fn type_name(&self) -> &str {
            "Tag"
        }
    }

    struct Other;

    impl Auditable for Other {
        fn identifier(&self) -> String {
            "x".into()
        }

        fn type_name(&self) -> &str {
            "Tag"
        }
    }

    fn registry() -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        registry.register::<Tag, _, _, _>(
            "Tag",
            |t| t.id.to_string(),
            |t| {
                let mut fields = EntityFields::new();
                fields.insert("label".into(), FieldValue::text(&t.label));
                Ok(fields)
            },
            |t, fields| {
                if let Some(label) = fields.get("label").and_then(|v| v.as_text()) {
                    t.label = label.to_string();
                }
                Ok(())
            },
        );
        registry
    }

    #[test]
    fn test_resolve_registered_type() {
        let registry = registry();
        let entry = registry.resolve("Tag").unwrap();
        let mut tag = Tag { id: 5, label: "rust".into() };

        assert_eq!(entry.identify(&tag).unwrap(), "5");
        let fields = entry.capture(&tag).unwrap();
        assert_eq!(fields["label"], FieldValue::text("rust"));

        let mut changed = fields.clone();
        changed.insert("label".into(), FieldValue::text("go"));
        entry.apply(&mut tag, &changed).unwrap();
        assert_eq!(tag.label, "go");
    }

    #[test]
    fn test_unknown_type() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("Comment"),
            Err(AuditError::UnknownEntityType(name)) if name == "Comment"
        ));
        assert!(!registry.is_registered("Comment"));
    }

    #[test]
    fn test_wrong_concrete_type_is_serialization_failure() {
        let registry = registry();
        let entry = registry.resolve("Tag").unwrap();
        assert!(matches!(entry.capture(&Other), Err(AuditError::SerializationFailure(_))));
    }

    #[test]
    fn test_reregister_replaces_entry() {
        let mut registry = registry();
        registry
            .register::<Tag, _, _, _>("Tag", |t| format!("tag-{}", t.id), |_| Ok(EntityFields::new()), |_, _| Ok(()))
            .with_deletion_marker("deleted_at");

        assert_eq!(registry.len(), 1);
        let entry = registry.resolve("Tag").unwrap();
        assert_eq!(entry.deletion_marker(), Some("deleted_at"));
        assert_eq!(entry.identify(&Tag { id: 1, label: String::new() }).unwrap(), "tag-1");
        assert_eq!(registry.type_names(), vec!["Tag".to_string()]);
    }
}
