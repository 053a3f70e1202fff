//! SQLite connection and schema migrations

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

use crate::paths;

/// Shared handle used across blocking storage tasks
pub type SharedDatabase = Arc<Database>;

/// Database wrapper owning one connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path and run migrations
    pub fn new(path: &Path) -> Result<Self> {
        paths::ensure_parent_dir(path)
            .with_context(|| format!("Failed to create directory for {:?}", path))?;

        let conn =
            Connection::open(path).with_context(|| format!("Failed to open database {:?}", path))?;

        // WAL keeps readers unblocked while a plan is being written
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        // other stratum processes may hold the write lock briefly
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Lock the connection
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        for &(name, sql) in MIGRATIONS {
            let applied: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?1)",
                [name],
                |row| row.get(0),
            )?;
            if applied {
                continue;
            }

            conn.execute_batch(sql)
                .with_context(|| format!("Migration {} failed", name))?;
            conn.execute(
                "INSERT INTO migrations (name, applied_at) VALUES (?1, ?2)",
                rusqlite::params![name, chrono::Utc::now().to_rfc3339()],
            )?;
            tracing::info!("Applied migration: {}", name);
        }

        Ok(())
    }
}

const MIGRATIONS: &[(&str, &str)] = &[(
    "001_plans",
    r#"
CREATE TABLE IF NOT EXISTS plans (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plans_status ON plans(status);
CREATE INDEX IF NOT EXISTS idx_plans_updated ON plans(updated_at);

CREATE TABLE IF NOT EXISTS plan_results (
    plan_id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#,
)];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_schema_and_reopens() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("nested").join("plans.db");

        {
            let db = Database::new(&db_path).unwrap();
            let count: i64 = db
                .conn()
                .query_row("SELECT COUNT(*) FROM plans", [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0);
        }

        // migrations are idempotent
        let db = Database::new(&db_path).unwrap();
        let applied: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 1);
    }
}
