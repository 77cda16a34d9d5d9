//! Queue repository: durable per-run id lists for the Solr update pipeline.
//!
//! A queue is a dynamically created table. It is built under a `tmp_`
//! prefixed name, renamed to its final name on commit, and dropped either
//! after seven days or when a newer run with the same parameter hash
//! supersedes it. Failure before finalize leaves only a `tmp_` table, which
//! the cleanup pass removes.

use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

use super::Result;

/// Final queue table prefix.
pub const QUEUE_PREFIX: &str = "mr_record_";
/// In-progress queue table prefix.
pub const TMP_QUEUE_PREFIX: &str = "tmp_mr_record_";

const CLEANUP_HORIZON_SECS: i64 = 7 * 24 * 3600;

/// SQLite-backed queue repository.
pub struct QueueRepository {
    db_path: PathBuf,
}

impl QueueRepository {
    /// Create a new queue repository.
    pub fn new(db_path: &Path) -> Result<Self> {
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    fn queue_name(hash: &str, from_unix: i64, last_unix: i64) -> String {
        format!("{QUEUE_PREFIX}{hash}_{from_unix}_{last_unix}")
    }

    /// Create a fresh transient queue, replacing any leftover with the same
    /// name, and return its table name.
    pub fn new_queue(&self, hash: &str, from_unix: i64, last_unix: i64) -> Result<String> {
        let name = format!("{TMP_QUEUE_PREFIX}{hash}_{from_unix}_{last_unix}");
        let conn = self.connect()?;
        conn.execute_batch(&format!(
            r#"
            DROP TABLE IF EXISTS "{name}";
            CREATE TABLE "{name}" (id TEXT PRIMARY KEY);
            "#
        ))?;
        Ok(name)
    }

    /// Add an id to a queue. Duplicate inserts are expected and ignored.
    pub fn push(&self, queue: &str, id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            &format!(r#"INSERT OR IGNORE INTO "{queue}" (id) VALUES (?1)"#),
            params![id],
        )?;
        Ok(())
    }

    /// Commit a transient queue under its final name, replacing any
    /// previous queue for the same parameters.
    pub fn finalize(&self, tmp_name: &str) -> Result<String> {
        let final_name = tmp_name
            .strip_prefix("tmp_")
            .unwrap_or(tmp_name)
            .to_string();
        let conn = self.connect()?;
        conn.execute_batch(&format!(
            r#"
            DROP TABLE IF EXISTS "{final_name}";
            ALTER TABLE "{tmp_name}" RENAME TO "{final_name}";
            "#
        ))?;
        Ok(final_name)
    }

    /// Look for an already finalized queue matching the parameters.
    pub fn find_finalized(&self, hash: &str, from_unix: i64, last_unix: i64) -> Result<Option<String>> {
        let name = Self::queue_name(hash, from_unix, last_unix);
        let conn = self.connect()?;
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            params![name],
            |row| row.get::<_, i64>(0).map(|c| c > 0),
        )?;
        Ok(exists.then_some(name))
    }

    /// Number of ids in a queue.
    pub fn count(&self, queue: &str) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row(&format!(r#"SELECT COUNT(*) FROM "{queue}""#), [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Restartable paged scan over a queue's ids.
    pub fn iterate<F>(&self, queue: &str, mut callback: F) -> Result<u64>
    where
        F: FnMut(String) -> Result<bool>,
    {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            r#"SELECT id FROM "{queue}" WHERE id > ? ORDER BY id LIMIT 1000"#
        ))?;
        let mut last_id = String::new();
        let mut seen: u64 = 0;
        loop {
            let page: Vec<String> = stmt
                .query_map(params![last_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if page.is_empty() {
                return Ok(seen);
            }
            for id in page {
                last_id = id.clone();
                seen += 1;
                if !callback(id)? {
                    return Ok(seen);
                }
            }
        }
    }

    /// Drop a queue table.
    pub fn drop_queue(&self, queue: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(&format!(r#"DROP TABLE IF EXISTS "{queue}""#))?;
        Ok(())
    }

    /// Remove queues whose trailing record timestamp is both older than the
    /// seven-day horizon and different from the current one. Transient
    /// leftovers from failed runs are held to the same rule.
    pub fn cleanup_old(&self, current_last_unix: i64) -> Result<u64> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND (name LIKE 'mr_record_%' OR name LIKE 'tmp_mr_record_%')",
        )?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let cutoff = chrono::Utc::now().timestamp() - CLEANUP_HORIZON_SECS;
        let mut removed = 0;
        for name in names {
            let Some(last_unix) = Self::parse_last_timestamp(&name) else {
                continue;
            };
            if last_unix != current_last_unix && last_unix < cutoff {
                conn.execute_batch(&format!(r#"DROP TABLE IF EXISTS "{name}""#))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn parse_last_timestamp(name: &str) -> Option<i64> {
        name.rsplit('_').next()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_repo() -> (TempDir, QueueRepository) {
        let dir = TempDir::new().unwrap();
        let repo = QueueRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_queue_lifecycle() {
        let (_dir, repo) = test_repo();
        let now = chrono::Utc::now().timestamp();

        assert!(repo.find_finalized("abcd", 0, now).unwrap().is_none());

        let tmp = repo.new_queue("abcd", 0, now).unwrap();
        repo.push(&tmp, "s1.1").unwrap();
        repo.push(&tmp, "s1.1").unwrap();
        repo.push(&tmp, "group1").unwrap();
        assert_eq!(repo.count(&tmp).unwrap(), 2);

        let final_name = repo.finalize(&tmp).unwrap();
        assert_eq!(repo.find_finalized("abcd", 0, now).unwrap(), Some(final_name.clone()));

        let mut ids = Vec::new();
        repo.iterate(&final_name, |id| {
            ids.push(id);
            Ok(true)
        })
        .unwrap();
        assert_eq!(ids.len(), 2);

        repo.drop_queue(&final_name).unwrap();
        assert!(repo.find_finalized("abcd", 0, now).unwrap().is_none());
    }

    #[test]
    fn test_cleanup_spares_current_and_recent() {
        let (_dir, repo) = test_repo();
        let now = chrono::Utc::now().timestamp();
        let old = now - 8 * 24 * 3600;

        let tmp_old = repo.new_queue("aaaa", 0, old).unwrap();
        repo.finalize(&tmp_old).unwrap();
        let tmp_current = repo.new_queue("bbbb", 0, now).unwrap();
        repo.finalize(&tmp_current).unwrap();

        let removed = repo.cleanup_old(now).unwrap();
        assert_eq!(removed, 1);
        assert!(repo.find_finalized("aaaa", 0, old).unwrap().is_none());
        assert!(repo.find_finalized("bbbb", 0, now).unwrap().is_some());
    }
}
