//! Dedup group repository for SQLite persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};

use super::{format_datetime, parse_datetime, to_option, Result};
use crate::models::DedupGroup;

/// SQLite-backed dedup group repository.
pub struct DedupRepository {
    db_path: PathBuf,
}

impl DedupRepository {
    /// Create a new dedup group repository.
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
            CREATE TABLE IF NOT EXISTS dedup_groups (
                id TEXT PRIMARY KEY,
                ids TEXT NOT NULL DEFAULT '[]',
                deleted INTEGER NOT NULL DEFAULT 0,
                changed INTEGER NOT NULL DEFAULT 0,
                updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dedup_updated ON dedup_groups(updated);
        "#,
        )?;
        Ok(())
    }

    fn row_to_group(row: &Row) -> rusqlite::Result<DedupGroup> {
        let ids: String = row.get("ids")?;
        Ok(DedupGroup {
            id: row.get("id")?,
            ids: serde_json::from_str(&ids).unwrap_or_default(),
            deleted: row.get::<_, i64>("deleted")? != 0,
            changed: row.get::<_, i64>("changed")? != 0,
            updated: parse_datetime(&row.get::<_, String>("updated")?),
        })
    }

    /// Get a group by ID.
    pub fn get(&self, id: &str) -> Result<Option<DedupGroup>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM dedup_groups WHERE id = ?")?;
        to_option(stmt.query_row(params![id], Self::row_to_group))
    }

    /// Upsert a group by id, stamping `updated`.
    pub fn save(&self, group: &DedupGroup) -> Result<()> {
        super::with_retry(|| self.save_once(group))
    }

    fn save_once(&self, group: &DedupGroup) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO dedup_groups (id, ids, deleted, changed, updated)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                ids = excluded.ids,
                deleted = excluded.deleted,
                changed = excluded.changed,
                updated = excluded.updated
            "#,
            params![
                group.id,
                serde_json::to_string(&group.ids)?,
                group.deleted as i64,
                group.changed as i64,
                format_datetime(&group.updated),
            ],
        )?;
        Ok(())
    }

    /// Hard-delete a group row.
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM dedup_groups WHERE id = ?", params![id])?;
        Ok(())
    }

    /// Group ids whose own row changed at or after a threshold.
    pub fn ids_updated_since(&self, since: &DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT id FROM dedup_groups WHERE updated >= ?")?;
        let ids = stmt
            .query_map(params![format_datetime(since)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Restartable paged scan over all groups, ordered by id.
    pub fn iterate<F>(&self, mut callback: F) -> Result<u64>
    where
        F: FnMut(DedupGroup) -> Result<bool>,
    {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM dedup_groups WHERE id > ? ORDER BY id LIMIT 1000")?;
        let mut last_id = String::new();
        let mut seen: u64 = 0;
        loop {
            let page: Vec<DedupGroup> = stmt
                .query_map(params![last_id], Self::row_to_group)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if page.is_empty() {
                return Ok(seen);
            }
            for group in page {
                last_id = group.id.clone();
                seen += 1;
                if !callback(group)? {
                    return Ok(seen);
                }
            }
        }
    }

    /// Count live groups.
    pub fn count_live(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM dedup_groups WHERE deleted = 0", [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_group_round_trip() {
        let dir = TempDir::new().unwrap();
        let repo = DedupRepository::new(&dir.path().join("test.db")).unwrap();

        let group = DedupGroup::new(vec!["s1.a".into(), "s2.b".into()]);
        repo.save(&group).unwrap();

        let loaded = repo.get(&group.id).unwrap().unwrap();
        assert_eq!(loaded.ids, group.ids);
        assert!(!loaded.deleted);
        assert!(loaded.changed);

        let since = loaded.updated - chrono::Duration::seconds(1);
        assert_eq!(repo.ids_updated_since(&since).unwrap(), vec![group.id.clone()]);
    }
}
