//! Chronicle Database Module
//! SQLite backend with connection pooling and audit schema bootstrap

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::engine::config::DatabaseConfig;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Audit tables. Hosts keep their own tables in the same database file so
/// entity writes and snapshot writes share one transaction.
const AUDIT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _chronicle_audit_logs (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS _chronicle_snapshots (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    change TEXT NOT NULL,
    payload TEXT NOT NULL,
    checksum TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    audit_log_id TEXT NOT NULL REFERENCES _chronicle_audit_logs(id)
);

CREATE INDEX IF NOT EXISTS _chronicle_snapshots_entity
    ON _chronicle_snapshots (entity_type, entity_id, created_at);

CREATE INDEX IF NOT EXISTS _chronicle_snapshots_log
    ON _chronicle_snapshots (audit_log_id);
";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to create database pool: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Database file not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self, DatabaseError> {
        Self::with_config(db_path, &DatabaseConfig::default())
    }

    pub fn with_config(db_path: &Path, config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(move |conn| init_connection(conn, busy_timeout));
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .connection_timeout(busy_timeout.max(Duration::from_secs(1)))
            .build(manager)?;

        let db = Self { pool };
        db.init_schema()?;
        tracing::debug!(path = %db_path.display(), "opened audit database");
        Ok(db)
    }

    /// Open an existing database file without creating it.
    pub fn open_existing(db_path: &Path, config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        if !db_path.exists() {
            return Err(DatabaseError::NotFound(db_path.display().to_string()));
        }
        Self::with_config(db_path, config)
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        // A single pooled connection keeps every caller on the same in-memory database.
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| init_connection(conn, Duration::from_secs(5)));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;
        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.pool.get()?;

        // WAL for file databases; in-memory databases report "memory" and keep going
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        install_audit_schema(&conn)?;

        Ok(())
    }

    pub fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        Ok(self.pool.get()?)
    }

    /// Run host DDL (entity tables) against the shared database.
    pub fn execute_batch(&self, sql: &str) -> Result<(), DatabaseError> {
        let conn = self.get_connection()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn get_tables(&self) -> Result<Vec<String>, DatabaseError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND substr(name, 1, 11) != '_chronicle_' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        )?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tables)
    }
}

/// Create the audit tables on a connection the caller manages itself.
pub fn install_audit_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(AUDIT_SCHEMA)
}

fn init_connection(conn: &mut rusqlite::Connection, busy_timeout: Duration) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA foreign_keys=ON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_creates_audit_tables() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_connection().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE '_chronicle_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_host_tables_listed_without_audit_tables() {
        let db = Database::in_memory().unwrap();
        db.execute_batch("CREATE TABLE posts (id TEXT PRIMARY KEY, title TEXT)")
            .unwrap();
        assert_eq!(db.get_tables().unwrap(), vec!["posts".to_string()]);
    }

    #[test]
    fn test_file_database_enables_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("data").join("audit.db")).unwrap();
        let conn = db.get_connection().unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_open_existing_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Database::open_existing(&dir.path().join("nope.db"), &DatabaseConfig::default());
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
    }
}
