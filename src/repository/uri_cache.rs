//! URI cache repository: cached external lookups for enrichment.
//!
//! TTL is enforced by readers; writers tolerate duplicate-key races.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

use super::{format_datetime, parse_datetime, to_option, Result};

/// A cached HTTP response body.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub headers: String,
    pub body: String,
}

/// SQLite-backed URI cache.
pub struct UriCacheRepository {
    db_path: PathBuf,
}

impl UriCacheRepository {
    /// Create a new URI cache repository.
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
            CREATE TABLE IF NOT EXISTS uri_cache (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                url TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    /// Get a cached response no older than `max_age`.
    pub fn get_valid(&self, id: &str, max_age: Duration) -> Result<Option<CachedResponse>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM uri_cache WHERE id = ?")?;
        let entry = to_option(stmt.query_row(params![id], |row| {
            Ok(CachedResponse {
                id: row.get("id")?,
                timestamp: parse_datetime(&row.get::<_, String>("timestamp")?),
                url: row.get("url")?,
                headers: row.get("headers")?,
                body: row.get("body")?,
            })
        }))?;

        Ok(entry.filter(|e| e.timestamp >= Utc::now() - max_age))
    }

    /// Store a response. A concurrent writer winning the race is fine; the
    /// insert is ignored rather than surfaced.
    pub fn put(&self, entry: &CachedResponse) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO uri_cache (id, timestamp, url, headers, body)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.id,
                format_datetime(&entry.timestamp),
                entry.url,
                entry.headers,
                entry.body
            ],
        )?;
        Ok(())
    }

    /// Drop entries older than `max_age`.
    pub fn prune(&self, max_age: Duration) -> Result<u64> {
        let conn = self.connect()?;
        let cutoff = Utc::now() - max_age;
        let removed = conn.execute(
            "DELETE FROM uri_cache WHERE timestamp < ?",
            params![format_datetime(&cutoff)],
        )?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ttl_enforced_by_reader() {
        let dir = TempDir::new().unwrap();
        let repo = UriCacheRepository::new(&dir.path().join("test.db")).unwrap();

        let entry = CachedResponse {
            id: "http://example.org/auth/1".into(),
            timestamp: Utc::now() - Duration::hours(2),
            url: "http://example.org/auth/1".into(),
            headers: String::new(),
            body: "{}".into(),
        };
        repo.put(&entry).unwrap();

        assert!(repo.get_valid(&entry.id, Duration::hours(1)).unwrap().is_none());
        assert!(repo.get_valid(&entry.id, Duration::hours(3)).unwrap().is_some());
    }

    #[test]
    fn test_duplicate_insert_is_ignored() {
        let dir = TempDir::new().unwrap();
        let repo = UriCacheRepository::new(&dir.path().join("test.db")).unwrap();

        let mut entry = CachedResponse {
            id: "x".into(),
            timestamp: Utc::now(),
            url: "http://example.org/x".into(),
            headers: String::new(),
            body: "first".into(),
        };
        repo.put(&entry).unwrap();
        entry.body = "second".into();
        repo.put(&entry).unwrap();

        let loaded = repo.get_valid("x", Duration::hours(1)).unwrap().unwrap();
        assert_eq!(loaded.body, "first");
    }
}
