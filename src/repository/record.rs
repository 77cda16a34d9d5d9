//! Record repository for SQLite persistence.
//!
//! Blocking keys are mirrored into a `record_keys` side table so that
//! candidate lookups stay indexed; the record row keeps the authoritative
//! JSON copies for round-tripping.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSqlOutput;
use rusqlite::{params, Connection, Row, ToSql};
use std::path::{Path, PathBuf};

use super::{format_datetime, parse_datetime, to_option, Result};
use crate::models::{Record, RecordFilter};

/// Default page size for restartable scans.
pub const ITERATE_PAGE_SIZE: usize = 1000;

/// Blocking-key kinds stored in the `record_keys` table.
pub const KEY_KIND_ISBN: &str = "isbn";
pub const KEY_KIND_TITLE: &str = "title";
pub const KEY_KIND_ID: &str = "id";

/// SQL bind parameter for dynamically built filters.
enum Param {
    Text(String),
    Int(i64),
}

impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Param::Text(s) => s.to_sql(),
            Param::Int(i) => i.to_sql(),
        }
    }
}

/// SQLite-backed record repository.
pub struct RecordRepository {
    db_path: PathBuf,
}

impl RecordRepository {
    /// Create a new record repository.
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
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                oai_id TEXT NOT NULL DEFAULT '',
                format TEXT NOT NULL,
                original_data TEXT NOT NULL,
                normalized_data TEXT NOT NULL DEFAULT '',
                linking_id TEXT NOT NULL DEFAULT '',
                host_record_id TEXT NOT NULL DEFAULT '',
                main_id TEXT NOT NULL DEFAULT '',
                deleted INTEGER NOT NULL DEFAULT 0,
                update_needed INTEGER NOT NULL DEFAULT 0,
                dedup_id TEXT,
                title_keys TEXT NOT NULL DEFAULT '[]',
                isbn_keys TEXT NOT NULL DEFAULT '[]',
                id_keys TEXT NOT NULL DEFAULT '[]',
                created TEXT NOT NULL,
                updated TEXT NOT NULL,
                date TEXT NOT NULL,
                mark INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_records_source ON records(source_id);
            CREATE INDEX IF NOT EXISTS idx_records_oai ON records(source_id, oai_id);
            CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated);
            CREATE INDEX IF NOT EXISTS idx_records_dirty ON records(update_needed);
            CREATE INDEX IF NOT EXISTS idx_records_dedup ON records(dedup_id);
            CREATE INDEX IF NOT EXISTS idx_records_main ON records(main_id);
            CREATE INDEX IF NOT EXISTS idx_records_host ON records(host_record_id);
            CREATE INDEX IF NOT EXISTS idx_records_linking ON records(source_id, linking_id);

            CREATE TABLE IF NOT EXISTS record_keys (
                record_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                PRIMARY KEY (record_id, kind, key)
            );
            CREATE INDEX IF NOT EXISTS idx_record_keys_lookup ON record_keys(kind, key);
        "#,
        )?;
        Ok(())
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<Record> {
        let title_keys: String = row.get("title_keys")?;
        let isbn_keys: String = row.get("isbn_keys")?;
        let id_keys: String = row.get("id_keys")?;
        Ok(Record {
            id: row.get("id")?,
            source_id: row.get("source_id")?,
            oai_id: row.get("oai_id")?,
            format: row.get("format")?,
            original_data: row.get("original_data")?,
            normalized_data: row.get("normalized_data")?,
            linking_id: row.get("linking_id")?,
            host_record_id: row.get("host_record_id")?,
            main_id: row.get("main_id")?,
            deleted: row.get::<_, i64>("deleted")? != 0,
            update_needed: row.get::<_, i64>("update_needed")? != 0,
            dedup_id: row.get("dedup_id")?,
            title_keys: serde_json::from_str(&title_keys).unwrap_or_default(),
            isbn_keys: serde_json::from_str(&isbn_keys).unwrap_or_default(),
            id_keys: serde_json::from_str(&id_keys).unwrap_or_default(),
            created: parse_datetime(&row.get::<_, String>("created")?),
            updated: parse_datetime(&row.get::<_, String>("updated")?),
            date: parse_datetime(&row.get::<_, String>("date")?),
            mark: row.get::<_, i64>("mark")? != 0,
        })
    }

    fn filter_clauses(filter: &RecordFilter) -> (String, Vec<Param>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<Param> = Vec::new();

        if let Some(source_id) = &filter.source_id {
            clauses.push("source_id = ?".into());
            binds.push(Param::Text(source_id.clone()));
        }
        if let Some(oai_id) = &filter.oai_id {
            clauses.push("oai_id = ?".into());
            binds.push(Param::Text(oai_id.clone()));
        }
        if let Some(main_id) = &filter.main_id {
            clauses.push("main_id = ?".into());
            binds.push(Param::Text(main_id.clone()));
        }
        if let Some(host) = &filter.host_record_id {
            clauses.push("host_record_id = ?".into());
            binds.push(Param::Text(host.clone()));
        }
        if let Some(deleted) = filter.deleted {
            clauses.push("deleted = ?".into());
            binds.push(Param::Int(deleted as i64));
        }
        if let Some(dirty) = filter.update_needed {
            clauses.push("update_needed = ?".into());
            binds.push(Param::Int(dirty as i64));
        }
        if let Some(has_dedup) = filter.has_dedup_id {
            if has_dedup {
                clauses.push("dedup_id IS NOT NULL".into());
            } else {
                clauses.push("dedup_id IS NULL".into());
            }
        }
        if let Some(since) = &filter.updated_since {
            clauses.push("updated >= ?".into());
            binds.push(Param::Text(format_datetime(since)));
        }
        if let Some(before) = &filter.updated_before {
            clauses.push("updated < ?".into());
            binds.push(Param::Text(format_datetime(before)));
        }
        if let Some(mark) = filter.mark {
            clauses.push("mark = ?".into());
            binds.push(Param::Int(mark as i64));
        }

        if clauses.is_empty() {
            (String::from("1=1"), binds)
        } else {
            (clauses.join(" AND "), binds)
        }
    }

    /// Get a record by ID.
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM records WHERE id = ?")?;
        to_option(stmt.query_row(params![id], Self::row_to_record))
    }

    /// Upsert a record by id and refresh its blocking-key rows.
    pub fn save(&self, record: &Record) -> Result<()> {
        super::with_retry(|| self.save_once(record))
    }

    fn save_once(&self, record: &Record) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO records (
                id, source_id, oai_id, format, original_data, normalized_data,
                linking_id, host_record_id, main_id, deleted, update_needed,
                dedup_id, title_keys, isbn_keys, id_keys, created, updated, date, mark
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(id) DO UPDATE SET
                source_id = excluded.source_id,
                oai_id = excluded.oai_id,
                format = excluded.format,
                original_data = excluded.original_data,
                normalized_data = excluded.normalized_data,
                linking_id = excluded.linking_id,
                host_record_id = excluded.host_record_id,
                main_id = excluded.main_id,
                deleted = excluded.deleted,
                update_needed = excluded.update_needed,
                dedup_id = excluded.dedup_id,
                title_keys = excluded.title_keys,
                isbn_keys = excluded.isbn_keys,
                id_keys = excluded.id_keys,
                updated = excluded.updated,
                date = excluded.date,
                mark = excluded.mark
            "#,
            params![
                record.id,
                record.source_id,
                record.oai_id,
                record.format,
                record.original_data,
                record.normalized_data,
                record.linking_id,
                record.host_record_id,
                record.main_id,
                record.deleted as i64,
                record.update_needed as i64,
                record.dedup_id,
                serde_json::to_string(&record.title_keys)?,
                serde_json::to_string(&record.isbn_keys)?,
                serde_json::to_string(&record.id_keys)?,
                format_datetime(&record.created),
                format_datetime(&record.updated),
                format_datetime(&record.date),
                record.mark as i64,
            ],
        )?;

        tx.execute("DELETE FROM record_keys WHERE record_id = ?", params![record.id])?;
        if !record.deleted {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO record_keys (record_id, kind, key) VALUES (?1, ?2, ?3)",
            )?;
            for key in &record.isbn_keys {
                stmt.execute(params![record.id, KEY_KIND_ISBN, key])?;
            }
            for key in &record.title_keys {
                stmt.execute(params![record.id, KEY_KIND_TITLE, key])?;
            }
            for key in &record.id_keys {
                stmt.execute(params![record.id, KEY_KIND_ID, key])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Hard-delete a record and its key rows.
    pub fn delete(&self, id: &str) -> Result<()> {
        super::with_retry(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM record_keys WHERE record_id = ?", params![id])?;
            tx.execute("DELETE FROM records WHERE id = ?", params![id])?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Set or clear the dedup dirty bit without touching `updated`.
    pub fn set_update_needed(&self, id: &str, update_needed: bool) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE records SET update_needed = ? WHERE id = ?",
            params![update_needed as i64, id],
        )?;
        Ok(())
    }

    /// Set or clear the dedup group back-pointer without touching `updated`.
    pub fn set_dedup_id(&self, id: &str, dedup_id: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE records SET dedup_id = ? WHERE id = ?",
            params![dedup_id, id],
        )?;
        Ok(())
    }

    /// Find all records matching a filter.
    pub fn find(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let conn = self.connect()?;
        let (clause, binds) = Self::filter_clauses(filter);
        let sql = format!("SELECT * FROM records WHERE {clause} ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(binds.iter()), Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Count records matching a filter.
    pub fn count(&self, filter: &RecordFilter) -> Result<u64> {
        let conn = self.connect()?;
        let (clause, binds) = Self::filter_clauses(filter);
        let sql = format!("SELECT COUNT(*) FROM records WHERE {clause}");
        let mut stmt = conn.prepare(&sql)?;
        let count: i64 =
            stmt.query_row(rusqlite::params_from_iter(binds.iter()), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Restartable paged scan over records matching a filter, ordered by id.
    ///
    /// Each page requests `id > last` with stable ordering, so an
    /// interrupted iteration resumes correctly and concurrent writers that
    /// do not touch already-seen ids are safe. The callback returns `false`
    /// to stop early.
    pub fn iterate<F>(&self, filter: &RecordFilter, mut callback: F) -> Result<u64>
    where
        F: FnMut(Record) -> Result<bool>,
    {
        let conn = self.connect()?;
        let (clause, binds) = Self::filter_clauses(filter);
        let sql = format!(
            "SELECT * FROM records WHERE id > ? AND {clause} ORDER BY id LIMIT {ITERATE_PAGE_SIZE}"
        );
        let mut stmt = conn.prepare(&sql)?;

        let mut last_id = String::new();
        let mut seen: u64 = 0;
        loop {
            let mut page_binds: Vec<&dyn ToSql> = vec![&last_id];
            for bind in &binds {
                page_binds.push(bind);
            }
            let page: Vec<Record> = stmt
                .query_map(&page_binds[..], Self::row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if page.is_empty() {
                return Ok(seen);
            }
            for record in page {
                last_id = record.id.clone();
                seen += 1;
                if !callback(record)? {
                    return Ok(seen);
                }
            }
        }
    }

    /// Find the records of one source matching an OAI identifier.
    pub fn find_by_oai_id(&self, source_id: &str, oai_id: &str) -> Result<Vec<Record>> {
        self.find(&RecordFilter {
            source_id: Some(source_id.to_string()),
            oai_id: Some(oai_id.to_string()),
            ..Default::default()
        })
    }

    /// Count live dedup candidates for one blocking key outside a source.
    pub fn count_key_matches(&self, kind: &str, key: &str, exclude_source: &str) -> Result<u64> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT COUNT(*) FROM record_keys k
            JOIN records r ON r.id = k.record_id
            WHERE k.kind = ?1 AND k.key = ?2
              AND r.source_id != ?3 AND r.deleted = 0 AND r.host_record_id = ''
            "#,
        )?;
        let count: i64 = stmt.query_row(params![kind, key, exclude_source], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Load live dedup candidates for one blocking key outside a source.
    pub fn find_by_key(&self, kind: &str, key: &str, exclude_source: &str) -> Result<Vec<Record>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT r.* FROM record_keys k
            JOIN records r ON r.id = k.record_id
            WHERE k.kind = ?1 AND k.key = ?2
              AND r.source_id != ?3 AND r.deleted = 0 AND r.host_record_id = ''
            ORDER BY r.id
            "#,
        )?;
        let records = stmt
            .query_map(params![kind, key, exclude_source], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Find the records of a source by linking id (host resolution).
    pub fn find_by_linking_id(&self, source_id: &str, linking_id: &str) -> Result<Vec<Record>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM records WHERE source_id = ? AND linking_id = ? AND deleted = 0 ORDER BY id",
        )?;
        let records = stmt
            .query_map(params![source_id, linking_id], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Load the live component parts attached to a host record.
    pub fn find_component_parts(&self, host_record_id: &str) -> Result<Vec<Record>> {
        self.find(&RecordFilter {
            host_record_id: Some(host_record_id.to_string()),
            deleted: Some(false),
            ..Default::default()
        })
    }

    /// Load every member record of a dedup group.
    pub fn find_by_dedup_id(&self, dedup_id: &str) -> Result<Vec<Record>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM records WHERE dedup_id = ? ORDER BY id")?;
        let records = stmt
            .query_map(params![dedup_id], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Distinct dedup group ids over records updated at or after a threshold.
    pub fn dedup_ids_updated_since(&self, since: &DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT dedup_id FROM records WHERE dedup_id IS NOT NULL AND updated >= ?",
        )?;
        let ids = stmt
            .query_map(params![format_datetime(since)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Newest `updated` timestamp in the store, if any records exist.
    pub fn newest_updated(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connect()?;
        let max: Option<String> =
            conn.query_row("SELECT MAX(updated) FROM records", [], |row| row.get(0))?;
        Ok(max.map(|s| parse_datetime(&s)))
    }

    /// Clear the reconciliation mark on all live records of a source.
    pub fn clear_marks(&self, source_id: &str) -> Result<u64> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE records SET mark = 0 WHERE source_id = ? AND deleted = 0",
            params![source_id],
        )?;
        Ok(changed as u64)
    }

    /// Mark the records of a source matching an OAI identifier as seen.
    pub fn mark_by_oai_id(&self, source_id: &str, oai_id: &str) -> Result<u64> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE records SET mark = 1 WHERE source_id = ? AND oai_id = ?",
            params![source_id, oai_id],
        )?;
        Ok(changed as u64)
    }

    /// Distinct source ids present in the store.
    pub fn source_ids(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT DISTINCT source_id FROM records ORDER BY source_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use tempfile::TempDir;

    fn test_repo() -> (TempDir, RecordRepository) {
        let dir = TempDir::new().unwrap();
        let repo = RecordRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    fn record(id: &str, source: &str) -> Record {
        Record::new(id.to_string(), source.to_string(), "dc".to_string())
    }

    #[test]
    fn test_save_and_get_round_trip() {
        let (_dir, repo) = test_repo();
        let mut rec = record("s1.1", "s1");
        rec.isbn_keys = vec!["9780201038019".into()];
        rec.title_keys = vec!["artofcomputer".into()];
        repo.save(&rec).unwrap();

        let loaded = repo.get("s1.1").unwrap().unwrap();
        assert_eq!(loaded.source_id, "s1");
        assert_eq!(loaded.isbn_keys, vec!["9780201038019".to_string()]);
        assert!(!loaded.deleted);
        assert!(repo.get("s1.2").unwrap().is_none());
    }

    #[test]
    fn test_upsert_preserves_created() {
        let (_dir, repo) = test_repo();
        let rec = record("s1.1", "s1");
        let created = rec.created;
        repo.save(&rec).unwrap();

        let mut changed = rec.clone();
        changed.original_data = "x".into();
        repo.save(&changed).unwrap();

        let loaded = repo.get("s1.1").unwrap().unwrap();
        assert_eq!(loaded.created.timestamp(), created.timestamp());
        assert_eq!(loaded.original_data, "x");
    }

    #[test]
    fn test_key_lookup_excludes_own_source_and_deleted() {
        let (_dir, repo) = test_repo();
        let mut a = record("s1.1", "s1");
        a.isbn_keys = vec!["9780201038019".into()];
        repo.save(&a).unwrap();

        let mut b = record("s2.1", "s2");
        b.isbn_keys = vec!["9780201038019".into()];
        repo.save(&b).unwrap();

        let matches = repo.find_by_key(KEY_KIND_ISBN, "9780201038019", "s1").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "s2.1");

        b.deleted = true;
        repo.save(&b).unwrap();
        assert_eq!(repo.count_key_matches(KEY_KIND_ISBN, "9780201038019", "s1").unwrap(), 0);
    }

    #[test]
    fn test_iterate_sees_every_record_once() {
        let (_dir, repo) = test_repo();
        for i in 0..25 {
            repo.save(&record(&format!("s1.{i:03}"), "s1")).unwrap();
        }
        let mut seen = Vec::new();
        repo.iterate(&RecordFilter::default(), |rec| {
            seen.push(rec.id);
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen.len(), 25);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 25);
    }

    #[test]
    fn test_mark_and_sweep_filters() {
        let (_dir, repo) = test_repo();
        let mut x = record("s1.x", "s1");
        x.oai_id = "oai:x".into();
        repo.save(&x).unwrap();
        let mut z = record("s1.z", "s1");
        z.oai_id = "oai:z".into();
        repo.save(&z).unwrap();

        repo.clear_marks("s1").unwrap();
        repo.mark_by_oai_id("s1", "oai:x").unwrap();

        let unmarked = repo
            .find(&RecordFilter {
                source_id: Some("s1".into()),
                deleted: Some(false),
                mark: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(unmarked.len(), 1);
        assert_eq!(unmarked[0].id, "s1.z");
    }
}
