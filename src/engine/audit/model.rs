//! Snapshot and audit log records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type SnapshotId = Uuid;
pub type AuditLogId = Uuid;

/// Captured entity state, keyed by field name. `BTreeMap` keeps the
/// serialized order stable.
pub type EntityFields = BTreeMap<String, FieldValue>;

/// Kind of mutation a snapshot records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "deleted" => Ok(ChangeKind::Deleted),
            _ => Err(format!("Unknown change kind: {}", s)),
        }
    }
}

/// A single captured field. Relations are held by identifier only, so a
/// snapshot can never contain a nested entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(#[serde(with = "canonical_timestamp")] DateTime<Utc>),
    Reference(String),
    References(Vec<String>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn optional_timestamp(value: Option<DateTime<Utc>>) -> Self {
        value.map(FieldValue::Timestamp).unwrap_or(FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&str> {
        match self {
            FieldValue::Reference(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_references(&self) -> Option<&[String]> {
        match self {
            FieldValue::References(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// RFC 3339, UTC, fixed microsecond precision
mod canonical_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Immutable capture of one entity at one point in its history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub entity_id: String,
    pub entity_type: String,
    pub change: ChangeKind,
    /// Canonical serialized state
    pub payload: String,
    /// SHA-256 of `payload`, hex encoded
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub audit_log_id: AuditLogId,
}

impl Snapshot {
    pub fn new(
        entity_type: &str,
        entity_id: &str,
        change: ChangeKind,
        payload: String,
        audit_log: &AuditLog,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            change,
            checksum: payload_checksum(&payload),
            payload,
            created_at: audit_log.created_at,
            audit_log_id: audit_log.id,
        }
    }

    pub fn verify(&self) -> bool {
        payload_checksum(&self.payload) == self.checksum
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id,
            created_at: self.created_at,
            audit_log_id: self.audit_log_id,
            change: self.change,
        }
    }
}

/// Read-only history row handed to external consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub created_at: DateTime<Utc>,
    pub audit_log_id: AuditLogId,
    pub change: ChangeKind,
}

/// Grouping of every snapshot written by one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: AuditLogId,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: truncate_to_micros(created_at),
        }
    }
}

/// Row counts across the audit tables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub audit_logs: u64,
    pub snapshots: u64,
    pub entities: u64,
}

pub fn payload_checksum(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Timestamps are persisted as integer microseconds.
pub(crate) fn truncate_to_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(t.timestamp_micros()).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_field_value_wire_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let json = serde_json::to_string(&FieldValue::Timestamp(at)).unwrap();
        assert_eq!(json, r#"{"type":"timestamp","value":"2024-03-01T12:00:00.000000Z"}"#);

        let json = serde_json::to_string(&FieldValue::References(vec!["7".into(), "9".into()])).unwrap();
        assert_eq!(json, r#"{"type":"references","value":["7","9"]}"#);

        assert_eq!(serde_json::to_string(&FieldValue::Null).unwrap(), r#"{"type":"null"}"#);
    }

    #[test]
    fn test_snapshot_inherits_audit_log_time_and_checksum() {
        let log = AuditLog::new(Utc::now());
        let snap = Snapshot::new("Post", "1", ChangeKind::Created, "{}".to_string(), &log);
        assert_eq!(snap.created_at, log.created_at);
        assert_eq!(snap.audit_log_id, log.id);
        assert!(snap.verify());

        let mut tampered = snap.clone();
        tampered.payload = r#"{"title":{"type":"text","value":"x"}}"#.to_string();
        assert!(!tampered.verify());
    }

    #[test]
    fn test_change_kind_parse() {
        assert_eq!("deleted".parse::<ChangeKind>().unwrap(), ChangeKind::Deleted);
        assert!("archived".parse::<ChangeKind>().is_err());
    }
}
