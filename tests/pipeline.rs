//! End-to-end pipeline tests: ingest, dedup and index-queue behavior over
//! a temporary store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bibfuse::config::{
    DataSourceConfig, DatabaseConfig, DedupConfig, EnrichmentConfig, HttpConfig, Settings,
    SiteConfig, SolrConfig,
};
use bibfuse::dedup::DedupHandler;
use bibfuse::ingest::Ingestor;
use bibfuse::mapper::FieldMapper;
use bibfuse::models::RecordFilter;
use bibfuse::repository::{
    DedupRepository, QueueRepository, RecordRepository, StateRepository,
};
use bibfuse::solr::{SolrUpdater, UpdateOptions};

fn source(id: &str) -> DataSourceConfig {
    let mut source: DataSourceConfig = toml::from_str(r#"format = "dc""#).unwrap();
    source.id = id.to_string();
    source.institution = format!("Inst {id}");
    source
}

fn settings(dir: &Path, source_ids: &[&str]) -> Settings {
    let mut sources = HashMap::new();
    for id in source_ids {
        sources.insert(id.to_string(), source(id));
    }
    Settings {
        site: SiteConfig::default(),
        database: DatabaseConfig {
            path: dir.join("test.db").display().to_string(),
        },
        solr: SolrConfig::default(),
        http: HttpConfig::default(),
        enrichment: EnrichmentConfig::default(),
        dedup: DedupConfig::default(),
        sources,
        base_dir: dir.to_path_buf(),
    }
}

fn dc_payload(id: &str, title: &str, isbn: &str, year: i32) -> String {
    format!(
        "<dc><title>{title}</title><creator>Knuth, Donald E.</creator>\
         <identifier>{id}</identifier><identifier>ISBN {isbn}</identifier>\
         <date>{year}</date><type>Book</type></dc>"
    )
}

struct Pipeline {
    settings: Settings,
    records: RecordRepository,
    groups: DedupRepository,
    state: StateRepository,
    queues: QueueRepository,
}

impl Pipeline {
    fn new(dir: &Path, source_ids: &[&str]) -> Self {
        let settings = settings(dir, source_ids);
        let db = settings.database_path();
        Self {
            records: RecordRepository::new(&db).unwrap(),
            groups: DedupRepository::new(&db).unwrap(),
            state: StateRepository::new(&db).unwrap(),
            queues: QueueRepository::new(&db).unwrap(),
            settings,
        }
    }

    fn ingest(&self, source_id: &str, oai_id: &str, deleted: bool, payload: &str) -> u64 {
        let source = self.settings.source(source_id).unwrap();
        let ingestor = Ingestor::new(source, &self.records, &self.groups).unwrap();
        ingestor.store_record(oai_id, deleted, payload).unwrap()
    }

    fn deduplicate(&self) {
        let mut handler = DedupHandler::new(
            &self.records,
            &self.groups,
            &self.settings.sources,
            &self.settings.dedup,
        );
        handler
            .deduplicate(None, &Arc::new(AtomicBool::new(false)))
            .unwrap();
    }
}

#[test]
fn duplicate_titles_across_sources_form_a_group() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = Pipeline::new(dir.path(), &["s1", "s2"]);

    pipeline.ingest(
        "s1",
        "oai:s1:a",
        false,
        &dc_payload("a", "The Art of Computer Programming", "0-201-03801-3", 1997),
    );
    pipeline.ingest(
        "s2",
        "oai:s2:b",
        false,
        &dc_payload("b", "Art of Computer Programming", "9780201038019", 1997),
    );

    pipeline.deduplicate();

    let a = pipeline.records.get("s1.a").unwrap().unwrap();
    let b = pipeline.records.get("s2.b").unwrap().unwrap();
    let group_id = a.dedup_id.clone().expect("s1.a should be grouped");
    assert_eq!(b.dedup_id.as_deref(), Some(group_id.as_str()));
    assert!(!a.update_needed);
    assert!(!b.update_needed);

    let group = pipeline.groups.get(&group_id).unwrap().unwrap();
    assert!(!group.deleted);
    let mut members = group.ids.clone();
    members.sort();
    assert_eq!(members, vec!["s1.a".to_string(), "s2.b".to_string()]);
}

#[test]
fn shared_isbn_merges_despite_distant_titles() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = Pipeline::new(dir.path(), &["s1", "s2"]);

    pipeline.ingest(
        "s1",
        "oai:s1:a",
        false,
        &dc_payload("a", "Fundamental Algorithms", "0-201-03801-3", 1997),
    );
    pipeline.ingest(
        "s2",
        "oai:s2:b",
        false,
        &dc_payload("b", "A Wholly Unrelated Name", "9780201038019", 1997),
    );

    pipeline.deduplicate();

    let a = pipeline.records.get("s1.a").unwrap().unwrap();
    let b = pipeline.records.get("s2.b").unwrap().unwrap();
    assert!(a.dedup_id.is_some());
    assert_eq!(a.dedup_id, b.dedup_id);
}

#[test]
fn deleting_a_member_detaches_and_requeues_the_other() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = Pipeline::new(dir.path(), &["s1", "s2"]);

    pipeline.ingest(
        "s1",
        "oai:s1:a",
        false,
        &dc_payload("a", "The Art of Computer Programming", "0-201-03801-3", 1997),
    );
    pipeline.ingest(
        "s2",
        "oai:s2:b",
        false,
        &dc_payload("b", "Art of Computer Programming", "9780201038019", 1997),
    );
    pipeline.deduplicate();

    let group_id = pipeline
        .records
        .get("s1.a")
        .unwrap()
        .unwrap()
        .dedup_id
        .unwrap();

    // the source reports the record gone
    assert_eq!(pipeline.ingest("s1", "oai:s1:a", true, ""), 1);

    let a = pipeline.records.get("s1.a").unwrap().unwrap();
    assert!(a.deleted);
    assert!(a.dedup_id.is_none());
    assert!(!a.update_needed);

    let group = pipeline.groups.get(&group_id).unwrap().unwrap();
    assert!(group.deleted);

    let b = pipeline.records.get("s2.b").unwrap().unwrap();
    assert!(b.dedup_id.is_none());
    assert!(b.update_needed);
}

#[tokio::test]
async fn update_run_reuses_the_finalized_queue() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = Pipeline::new(dir.path(), &["s1", "s2"]);

    pipeline.ingest(
        "s1",
        "oai:s1:a",
        false,
        &dc_payload("a", "The Art of Computer Programming", "0-201-03801-3", 1997),
    );
    pipeline.ingest(
        "s2",
        "oai:s2:b",
        false,
        &dc_payload("b", "Art of Computer Programming", "9780201038019", 1997),
    );
    pipeline.deduplicate();

    let mapper = FieldMapper::default();
    let updater = SolrUpdater::new(
        &pipeline.settings,
        &pipeline.records,
        &pipeline.groups,
        &pipeline.queues,
        &pipeline.state,
        &mapper,
        Vec::new(),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    // dump mode keeps the run offline; the queue lifecycle is the same
    let opts = UpdateOptions {
        from: Some(chrono::DateTime::UNIX_EPOCH),
        dump_prefix: Some(dir.path().join("dump").display().to_string()),
        ..UpdateOptions::default()
    };

    let first = updater.update(&opts).await.unwrap();
    assert_eq!(first.updated, 1, "one merged document for the pair");

    // no intervening writes: the second run must reuse the same queue and
    // deliver the same document set
    let second = updater.update(&opts).await.unwrap();
    assert_eq!(second.updated, first.updated);

    let dump = std::fs::read_to_string(dir.path().join("dump-batch-000001.json")).unwrap();
    assert!(dump.contains("merged_boolean"));
    assert!(dump.contains("9780201038019"));
}

#[test]
fn unmarked_records_are_swept_after_identifier_listing() {
    let dir = tempfile::TempDir::new().unwrap();
    let pipeline = Pipeline::new(dir.path(), &["s1"]);

    for (local, oai) in [("x", "oai:s1:x"), ("y", "oai:s1:y"), ("z", "oai:s1:z")] {
        pipeline.ingest(
            "s1",
            oai,
            false,
            &dc_payload(local, &format!("Record {local}"), "", 2001),
        );
    }

    // the upstream listing now reports only x and y
    pipeline.records.clear_marks("s1").unwrap();
    pipeline.records.mark_by_oai_id("s1", "oai:s1:x").unwrap();
    pipeline.records.mark_by_oai_id("s1", "oai:s1:y").unwrap();

    let source = pipeline.settings.source("s1").unwrap();
    let ingestor = Ingestor::new(source, &pipeline.records, &pipeline.groups).unwrap();
    let unmarked = pipeline
        .records
        .find(&RecordFilter {
            source_id: Some("s1".into()),
            deleted: Some(false),
            mark: Some(false),
            ..Default::default()
        })
        .unwrap();
    for record in unmarked {
        ingestor.tombstone(record).unwrap();
    }

    assert!(pipeline.records.get("s1.z").unwrap().unwrap().deleted);
    assert!(!pipeline.records.get("s1.x").unwrap().unwrap().deleted);
    assert!(!pipeline.records.get("s1.y").unwrap().unwrap().deleted);
}
