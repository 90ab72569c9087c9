//! Snapshot Store
//!
//! Append-only repository of audit logs and snapshots. Every method runs on
//! the caller's connection; writes refuse to run outside a transaction so
//! that an entity mutation and its audit record commit or abort together.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use uuid::Uuid;

use super::model::{AuditLog, AuditLogId, ChangeKind, Snapshot, SnapshotId, SnapshotSummary, StoreStats};
use crate::engine::error::{AuditError, Result};

const SNAPSHOT_COLUMNS: &str =
    "id, entity_id, entity_type, change, payload, checksum, created_at, audit_log_id";

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotStore;

impl SnapshotStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert one snapshot. Its audit log row must already exist.
    pub fn save(&self, conn: &Connection, snapshot: &Snapshot) -> Result<SnapshotId> {
        require_transaction(conn)?;

        if let Some(latest) = self.latest_created_at(conn, &snapshot.entity_type, &snapshot.entity_id)? {
            if latest >= snapshot.created_at {
                return Err(AuditError::InvalidAuditLog(format!(
                    "snapshot of {} {} at {} is not newer than {}",
                    snapshot.entity_type, snapshot.entity_id, snapshot.created_at, latest
                )));
            }
        }

        conn.execute(
            "INSERT INTO _chronicle_snapshots (id, entity_id, entity_type, change, payload, checksum, created_at, audit_log_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.id.to_string(),
                snapshot.entity_id,
                snapshot.entity_type,
                snapshot.change.as_str(),
                snapshot.payload,
                snapshot.checksum,
                snapshot.created_at.timestamp_micros(),
                snapshot.audit_log_id.to_string(),
            ],
        )?;

        tracing::debug!(
            snapshot_id = %snapshot.id,
            entity_type = %snapshot.entity_type,
            entity_id = %snapshot.entity_id,
            change = %snapshot.change,
            "saved snapshot"
        );
        Ok(snapshot.id)
    }

    /// Insert an audit log together with its batch of snapshots. Either all
    /// rows land or none do.
    pub fn save_audit_log(&self, conn: &Connection, audit_log: &AuditLog, snapshots: &[Snapshot]) -> Result<()> {
        require_transaction(conn)?;
        validate_batch(audit_log, snapshots)?;

        conn.execute_batch("SAVEPOINT chronicle_audit_log")?;
        match self.insert_batch(conn, audit_log, snapshots) {
            Ok(()) => {
                conn.execute_batch("RELEASE chronicle_audit_log")?;
                tracing::info!(
                    audit_log_id = %audit_log.id,
                    snapshots = snapshots.len(),
                    "recorded audit log"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = conn.execute_batch("ROLLBACK TO chronicle_audit_log; RELEASE chronicle_audit_log") {
                    tracing::error!(
                        audit_log_id = %audit_log.id,
                        error = %cleanup,
                        "could not roll back audit log savepoint"
                    );
                }
                Err(e)
            }
        }
    }

    fn insert_batch(&self, conn: &Connection, audit_log: &AuditLog, snapshots: &[Snapshot]) -> Result<()> {
        conn.execute(
            "INSERT INTO _chronicle_audit_logs (id, created_at) VALUES (?1, ?2)",
            params![audit_log.id.to_string(), audit_log.created_at.timestamp_micros()],
        )?;
        for snapshot in snapshots {
            self.save(conn, snapshot)?;
        }
        Ok(())
    }

    pub fn get(&self, conn: &Connection, snapshot_id: SnapshotId) -> Result<Snapshot> {
        let sql = format!("SELECT {} FROM _chronicle_snapshots WHERE id = ?1", SNAPSHOT_COLUMNS);
        let snapshot = conn
            .query_row(&sql, [snapshot_id.to_string()], snapshot_from_row)
            .optional()?
            .ok_or_else(|| AuditError::SnapshotNotFound(snapshot_id.to_string()))?;
        verified(snapshot)
    }

    /// All snapshots of one entity, oldest first
    pub fn list_by_entity(&self, conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Vec<Snapshot>> {
        let sql = format!(
            "SELECT {} FROM _chronicle_snapshots
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at ASC, rowid ASC",
            SNAPSHOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let snapshots = stmt
            .query_map(params![entity_type, entity_id], snapshot_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        snapshots.into_iter().map(verified).collect()
    }

    /// History view without payloads, oldest first
    pub fn history(&self, conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Vec<SnapshotSummary>> {
        let mut stmt = conn.prepare(
            "SELECT id, created_at, audit_log_id, change FROM _chronicle_snapshots
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![entity_type, entity_id], |row| {
                Ok(SnapshotSummary {
                    id: uuid_column(row, 0)?,
                    created_at: timestamp_column(row, 1)?,
                    audit_log_id: uuid_column(row, 2)?,
                    change: change_column(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest snapshot strictly older than `timestamp`
    pub fn latest_before(
        &self,
        conn: &Connection,
        entity_type: &str,
        entity_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Snapshot>> {
        let sql = format!(
            "SELECT {} FROM _chronicle_snapshots
             WHERE entity_type = ?1 AND entity_id = ?2 AND created_at < ?3
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        );
        conn.query_row(
            &sql,
            params![entity_type, entity_id, timestamp.timestamp_micros()],
            snapshot_from_row,
        )
        .optional()?
        .map(verified)
        .transpose()
    }

    pub fn latest(&self, conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Option<Snapshot>> {
        let sql = format!(
            "SELECT {} FROM _chronicle_snapshots
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        );
        conn.query_row(&sql, params![entity_type, entity_id], snapshot_from_row)
            .optional()?
            .map(verified)
            .transpose()
    }

    /// The snapshot recorded just before the newest one. Only those two rows
    /// are read, and only the returned one is verified.
    pub fn previous(&self, conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Option<Snapshot>> {
        let sql = format!(
            "SELECT {} FROM _chronicle_snapshots
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 2",
            SNAPSHOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut newest_two = stmt
            .query_map(params![entity_type, entity_id], snapshot_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if newest_two.len() < 2 {
            return Ok(None);
        }
        newest_two.pop().map(verified).transpose()
    }

    /// Timestamp of the newest snapshot, without loading its payload
    pub fn latest_created_at(
        &self,
        conn: &Connection,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let micros: Option<i64> = conn.query_row(
            "SELECT MAX(created_at) FROM _chronicle_snapshots WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, entity_id],
            |row| row.get(0),
        )?;
        Ok(micros.and_then(DateTime::from_timestamp_micros))
    }

    /// An audit log and its snapshots in insertion order
    pub fn get_audit_log(&self, conn: &Connection, audit_log_id: AuditLogId) -> Result<(AuditLog, Vec<Snapshot>)> {
        let audit_log = conn
            .query_row(
                "SELECT id, created_at FROM _chronicle_audit_logs WHERE id = ?1",
                [audit_log_id.to_string()],
                |row| {
                    Ok(AuditLog {
                        id: uuid_column(row, 0)?,
                        created_at: timestamp_column(row, 1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| AuditError::InvalidAuditLog(format!("audit log not found: {}", audit_log_id)))?;

        let sql = format!(
            "SELECT {} FROM _chronicle_snapshots WHERE audit_log_id = ?1 ORDER BY rowid ASC",
            SNAPSHOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let snapshots = stmt
            .query_map([audit_log_id.to_string()], snapshot_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(verified)
            .collect::<Result<Vec<_>>>()?;

        Ok((audit_log, snapshots))
    }

    pub fn stats(&self, conn: &Connection) -> Result<StoreStats> {
        let stats = conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM _chronicle_audit_logs),
                (SELECT COUNT(*) FROM _chronicle_snapshots),
                (SELECT COUNT(*) FROM (SELECT DISTINCT entity_type, entity_id FROM _chronicle_snapshots))",
            [],
            |row| {
                Ok(StoreStats {
                    audit_logs: row.get::<_, i64>(0)? as u64,
                    snapshots: row.get::<_, i64>(1)? as u64,
                    entities: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(stats)
    }
}

fn require_transaction(conn: &Connection) -> Result<()> {
    if conn.is_autocommit() {
        return Err(AuditError::TransactionRequired);
    }
    Ok(())
}

fn validate_batch(audit_log: &AuditLog, snapshots: &[Snapshot]) -> Result<()> {
    if snapshots.is_empty() {
        return Err(AuditError::InvalidAuditLog(format!(
            "audit log {} has no snapshots",
            audit_log.id
        )));
    }

    let mut seen = HashSet::new();
    for snapshot in snapshots {
        if snapshot.audit_log_id != audit_log.id {
            return Err(AuditError::InvalidAuditLog(format!(
                "snapshot {} belongs to audit log {}",
                snapshot.id, snapshot.audit_log_id
            )));
        }
        if snapshot.created_at != audit_log.created_at {
            return Err(AuditError::InvalidAuditLog(format!(
                "snapshot {} time differs from its audit log",
                snapshot.id
            )));
        }
        if !seen.insert((snapshot.entity_type.as_str(), snapshot.entity_id.as_str())) {
            return Err(AuditError::InvalidAuditLog(format!(
                "{} {} appears twice in one audit log",
                snapshot.entity_type, snapshot.entity_id
            )));
        }
    }
    Ok(())
}

fn verified(snapshot: Snapshot) -> Result<Snapshot> {
    if !snapshot.verify() {
        tracing::warn!(snapshot_id = %snapshot.id, "snapshot payload does not match its checksum");
        return Err(AuditError::IntegrityMismatch {
            snapshot_id: snapshot.id.to_string(),
        });
    }
    Ok(snapshot)
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: uuid_column(row, 0)?,
        entity_id: row.get(1)?,
        entity_type: row.get(2)?,
        change: change_column(row, 3)?,
        payload: row.get(4)?,
        checksum: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        audit_log_id: uuid_column(row, 7)?,
    })
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn change_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<ChangeKind> {
    let raw: String = row.get(idx)?;
    raw.parse::<ChangeKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", micros).into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::audit::model::truncate_to_micros;
    use crate::engine::database::DatabaseError;
    use chrono::Duration;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys=ON;
             CREATE TABLE _chronicle_audit_logs (id TEXT PRIMARY KEY, created_at INTEGER NOT NULL);
             CREATE TABLE _chronicle_snapshots (
                id TEXT PRIMARY KEY, entity_id TEXT NOT NULL, entity_type TEXT NOT NULL,
                change TEXT NOT NULL, payload TEXT NOT NULL, checksum TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                audit_log_id TEXT NOT NULL REFERENCES _chronicle_audit_logs(id));",
        )
        .unwrap();
        conn
    }

    fn record(conn: &Connection, at: DateTime<Utc>, entities: &[(&str, &str)]) -> (AuditLog, Vec<Snapshot>) {
        let log = AuditLog::new(at);
        let snaps: Vec<Snapshot> = entities
            .iter()
            .map(|(t, id)| {
                Snapshot::new(t, id, ChangeKind::Modified, format!(r#"{{"n":{{"type":"text","value":"{}"}}}}"#, id), &log)
            })
            .collect();
        conn.execute_batch("BEGIN").unwrap();
        SnapshotStore::new().save_audit_log(conn, &log, &snaps).unwrap();
        conn.execute_batch("COMMIT").unwrap();
        (log, snaps)
    }

    #[test]
    fn test_writes_require_transaction() {
        let conn = conn();
        let log = AuditLog::new(Utc::now());
        let snap = Snapshot::new("Post", "1", ChangeKind::Created, "{}".into(), &log);
        let store = SnapshotStore::new();
        assert!(matches!(store.save(&conn, &snap), Err(AuditError::TransactionRequired)));
        assert!(matches!(
            store.save_audit_log(&conn, &log, &[snap]),
            Err(AuditError::TransactionRequired)
        ));
    }

    #[test]
    fn test_list_by_entity_oldest_first() {
        let conn = conn();
        let t0 = truncate_to_micros(Utc::now());
        record(&conn, t0 + Duration::seconds(2), &[("Post", "1")]);

        // an older snapshot for the same entity is refused
        let store = SnapshotStore::new();
        let stale_log = AuditLog::new(t0);
        let stale = Snapshot::new("Post", "1", ChangeKind::Modified, "{}".into(), &stale_log);
        conn.execute_batch("BEGIN").unwrap();
        assert!(matches!(
            store.save_audit_log(&conn, &stale_log, &[stale]),
            Err(AuditError::InvalidAuditLog(_))
        ));
        conn.execute_batch("COMMIT").unwrap();
        let list = store.list_by_entity(&conn, "Post", "1").unwrap();
        assert_eq!(list.len(), 1);

        record(&conn, t0 + Duration::seconds(5), &[("Post", "1")]);
        let list = store.list_by_entity(&conn, "Post", "1").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].created_at < list[1].created_at);

        let history = store.history(&conn, "Post", "1").unwrap();
        assert_eq!(history, list.iter().map(|s| s.summary()).collect::<Vec<_>>());
    }

    #[test]
    fn test_latest_before_is_strict() {
        let conn = conn();
        let t0 = truncate_to_micros(Utc::now());
        let (_, first) = record(&conn, t0, &[("Post", "1")]);
        let (_, second) = record(&conn, t0 + Duration::seconds(1), &[("Post", "1")]);
        let store = SnapshotStore::new();

        let before = store.latest_before(&conn, "Post", "1", second[0].created_at).unwrap();
        assert_eq!(before.map(|s| s.id), Some(first[0].id));
        assert!(store.latest_before(&conn, "Post", "1", t0).unwrap().is_none());
        assert_eq!(store.latest(&conn, "Post", "1").unwrap().map(|s| s.id), Some(second[0].id));
    }

    #[test]
    fn test_get_and_audit_log_lookup() {
        let conn = conn();
        let (log, snaps) = record(&conn, Utc::now(), &[("Post", "1"), ("Comment", "9")]);
        let store = SnapshotStore::new();

        let fetched = store.get(&conn, snaps[1].id).unwrap();
        assert_eq!(fetched.entity_type, "Comment");
        assert_eq!(fetched.created_at, log.created_at);

        let (loaded_log, members) = store.get_audit_log(&conn, log.id).unwrap();
        assert_eq!(loaded_log, log);
        assert_eq!(members.iter().map(|s| s.id).collect::<Vec<_>>(), vec![snaps[0].id, snaps[1].id]);

        assert!(matches!(
            store.get(&conn, Uuid::new_v4()),
            Err(AuditError::SnapshotNotFound(_))
        ));

        let stats = store.stats(&conn).unwrap();
        assert_eq!(stats, StoreStats { audit_logs: 1, snapshots: 2, entities: 2 });
    }

    #[test]
    fn test_empty_and_duplicate_batches_rejected() {
        let conn = conn();
        let store = SnapshotStore::new();
        let log = AuditLog::new(Utc::now());
        let a = Snapshot::new("Post", "1", ChangeKind::Created, "{}".into(), &log);
        let b = Snapshot::new("Post", "1", ChangeKind::Modified, "{}".into(), &log);

        conn.execute_batch("BEGIN").unwrap();
        assert!(matches!(store.save_audit_log(&conn, &log, &[]), Err(AuditError::InvalidAuditLog(_))));
        assert!(matches!(store.save_audit_log(&conn, &log, &[a, b]), Err(AuditError::InvalidAuditLog(_))));
        conn.execute_batch("COMMIT").unwrap();

        assert_eq!(store.stats(&conn).unwrap(), StoreStats::default());
    }

    #[test]
    fn test_failed_batch_leaves_no_rows() {
        let conn = conn();
        let t0 = truncate_to_micros(Utc::now());
        record(&conn, t0 + Duration::seconds(10), &[("Post", "1")]);

        // second entity in the batch is older than its stored history
        let log = AuditLog::new(t0);
        let snaps = vec![
            Snapshot::new("Post", "2", ChangeKind::Created, "{}".into(), &log),
            Snapshot::new("Post", "1", ChangeKind::Modified, "{}".into(), &log),
        ];
        let store = SnapshotStore::new();
        conn.execute_batch("BEGIN").unwrap();
        assert!(store.save_audit_log(&conn, &log, &snaps).is_err());
        conn.execute_batch("COMMIT").unwrap();

        assert!(store.list_by_entity(&conn, "Post", "2").unwrap().is_empty());
        assert_eq!(store.stats(&conn).unwrap().audit_logs, 1);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let conn = conn();
        let (_, snaps) = record(&conn, Utc::now(), &[("Post", "1")]);
        conn.execute(
            "UPDATE _chronicle_snapshots SET payload = '{}' WHERE id = ?1",
            [snaps[0].id.to_string()],
        )
        .unwrap();

        assert!(matches!(
            SnapshotStore::new().get(&conn, snaps[0].id),
            Err(AuditError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_previous_reads_only_the_newest_two() {
        let conn = conn();
        let t0 = truncate_to_micros(Utc::now());
        let store = SnapshotStore::new();
        let (_, first) = record(&conn, t0, &[("Post", "1")]);
        assert!(store.previous(&conn, "Post", "1").unwrap().is_none());

        let (_, second) = record(&conn, t0 + Duration::seconds(1), &[("Post", "1")]);
        record(&conn, t0 + Duration::seconds(2), &[("Post", "1")]);

        // damage outside the newest two rows does not matter
        conn.execute(
            "UPDATE _chronicle_snapshots SET payload = '{}' WHERE id = ?1",
            [first[0].id.to_string()],
        )
        .unwrap();
        assert_eq!(store.previous(&conn, "Post", "1").unwrap().map(|s| s.id), Some(second[0].id));
        assert!(store.list_by_entity(&conn, "Post", "1").is_err());
    }

    #[test]
    fn test_failed_savepoint_cleanup_keeps_insert_error() {
        // a conflicting snapshot id aborts the whole transaction, savepoint included
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE _chronicle_audit_logs (id TEXT PRIMARY KEY, created_at INTEGER NOT NULL);
             CREATE TABLE _chronicle_snapshots (
                id TEXT PRIMARY KEY ON CONFLICT ROLLBACK, entity_id TEXT NOT NULL, entity_type TEXT NOT NULL,
                change TEXT NOT NULL, payload TEXT NOT NULL, checksum TEXT NOT NULL,
                created_at INTEGER NOT NULL, audit_log_id TEXT NOT NULL);",
        )
        .unwrap();
        let t0 = truncate_to_micros(Utc::now());
        let (_, first) = record(&conn, t0, &[("Post", "1")]);

        let log = AuditLog::new(t0 + Duration::seconds(1));
        let mut clash = Snapshot::new("Post", "2", ChangeKind::Created, "{}".into(), &log);
        clash.id = first[0].id;

        let store = SnapshotStore::new();
        conn.execute_batch("BEGIN").unwrap();
        let err = store.save_audit_log(&conn, &log, &[clash]).unwrap_err();
        assert!(matches!(
            err,
            AuditError::StorageFailure(DatabaseError::SqliteError(rusqlite::Error::SqliteFailure(ref e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        ));
        assert!(conn.is_autocommit());
        assert_eq!(store.stats(&conn).unwrap(), StoreStats { audit_logs: 1, snapshots: 1, entities: 1 });
    }
}
