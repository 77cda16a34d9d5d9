//! State repository: opaque key/value entries tracking harvest and index
//! progress per source.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

use super::{format_datetime, parse_datetime_opt, to_option, Result};

/// SQLite-backed state repository.
pub struct StateRepository {
    db_path: PathBuf,
}

impl StateRepository {
    /// Create a new state repository.
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    /// Get a state value.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT value FROM state WHERE key = ?")?;
        to_option(stmt.query_row(params![key], |row| row.get(0)))
    }

    /// Set a state value.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, value, format_datetime(&Utc::now())],
        )?;
        Ok(())
    }

    /// Remove a state entry.
    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM state WHERE key = ?", params![key])?;
        Ok(())
    }

    /// Get a state value parsed as a timestamp.
    pub fn get_datetime(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(parse_datetime_opt(self.get(key)?))
    }

    /// Set a state value from a timestamp.
    pub fn set_datetime(&self, key: &str, value: &DateTime<Utc>) -> Result<()> {
        self.set(key, &format_datetime(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let repo = StateRepository::new(&dir.path().join("test.db")).unwrap();

        assert!(repo.get("Last Harvest Date s1").unwrap().is_none());
        repo.set("Last Harvest Date s1", "2024-01-01T00:00:00+00:00").unwrap();
        assert_eq!(
            repo.get("Last Harvest Date s1").unwrap().unwrap(),
            "2024-01-01T00:00:00+00:00"
        );

        let ts = repo.get_datetime("Last Harvest Date s1").unwrap().unwrap();
        assert_eq!(ts.timestamp(), 1704067200);

        repo.remove("Last Harvest Date s1").unwrap();
        assert!(repo.get("Last Harvest Date s1").unwrap().is_none());
    }
}
