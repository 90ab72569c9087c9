//! Snapshot Serializer
//!
//! Turns an entity's captured fields into the canonical payload stored on a
//! snapshot, and back. The payload is a JSON object with keys in sorted
//! order; every field is tagged with its kind so it restores to the same
//! `FieldValue`.

use super::model::{EntityFields, FieldValue};
use super::registry::RegistryEntry;
use crate::engine::entity::Auditable;
use crate::engine::error::{AuditError, Result};

/// Output of capturing one entity
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedState {
    pub entity_id: String,
    pub fields: EntityFields,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotSerializer;

impl SnapshotSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Identify and serialize `entity` through its registry entry.
    pub fn capture(&self, entity: &dyn Auditable, entry: &RegistryEntry) -> Result<CapturedState> {
        let entity_id = entry.identify(entity)?;
        if entity_id.is_empty() {
            return Err(AuditError::SerializationFailure(format!(
                "{} has an empty identifier",
                entry.type_name()
            )));
        }

        let fields = entry.capture(entity)?;
        let payload = self.encode(&fields).map_err(|e| match e {
            AuditError::SerializationFailure(msg) => AuditError::SerializationFailure(format!(
                "{} {}: {}",
                entry.type_name(),
                entity_id,
                msg
            )),
            other => other,
        })?;

        Ok(CapturedState {
            entity_id,
            fields,
            payload,
        })
    }

    pub fn encode(&self, fields: &EntityFields) -> Result<String> {
        for (name, value) in fields {
            validate_field(name, value)?;
        }
        Ok(serde_json::to_string(fields)?)
    }

    pub fn decode(&self, payload: &str) -> Result<EntityFields> {
        let fields: EntityFields = serde_json::from_str(payload)
            .map_err(|e| AuditError::SerializationFailure(format!("malformed snapshot payload: {}", e)))?;
        for (name, value) in &fields {
            validate_field(name, value)?;
        }
        Ok(fields)
    }
}

fn validate_field(name: &str, value: &FieldValue) -> Result<()> {
    if name.is_empty() {
        return Err(AuditError::SerializationFailure("empty field name".into()));
    }
    match value {
        // serde_json would silently write NaN/inf as null
        FieldValue::Real(f) if !f.is_finite() => Err(AuditError::SerializationFailure(format!(
            "field '{}' holds a non-finite number",
            name
        ))),
        FieldValue::References(ids) if ids.iter().any(|id| id.is_empty()) => Err(
            AuditError::SerializationFailure(format!("field '{}' holds an empty reference", name)),
        ),
        FieldValue::Reference(id) if id.is_empty() => Err(AuditError::SerializationFailure(
            format!("field '{}' holds an empty reference", name),
        )),
        _ => Ok(()),
    }
}

/// Fetch a field an apply function cannot do without
pub fn required_field<'a>(fields: &'a EntityFields, name: &str) -> Result<&'a FieldValue> {
    fields
        .get(name)
        .ok_or_else(|| AuditError::SerializationFailure(format!("snapshot is missing field '{}'", name)))
}

pub fn required_text<'a>(fields: &'a EntityFields, name: &str) -> Result<&'a str> {
    required_field(fields, name)?
        .as_text()
        .ok_or_else(|| wrong_kind(name, "text"))
}

pub fn required_integer(fields: &EntityFields, name: &str) -> Result<i64> {
    required_field(fields, name)?
        .as_integer()
        .ok_or_else(|| wrong_kind(name, "integer"))
}

fn wrong_kind(name: &str, expected: &str) -> AuditError {
    AuditError::SerializationFailure(format!("field '{}' is not {}", name, expected))
}
