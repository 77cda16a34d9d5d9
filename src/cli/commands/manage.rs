//! Manage command: maintenance operations over the store and the index.

use console::style;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::helpers::App;
use crate::dedup::{check_dedup_consistency, detach_record, DedupHandler};
use crate::ingest::Ingestor;
use crate::models::RecordFilter;
use crate::solr::UpdateOptions;
use crate::utils::parse_date_arg;

pub async fn cmd_renormalize(
    app: &App,
    source_id: Option<String>,
    terminated: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let source_ids: Vec<String> = match source_id {
        Some(id) => vec![id],
        None => app.settings.sources.keys().cloned().collect(),
    };

    let mut total = 0u64;
    for source_id in source_ids {
        let source = app.settings.source(&source_id)?;
        let ingestor = Ingestor::new(source, &app.records, &app.groups)?;
        let filter = RecordFilter::live_source(&source_id);

        let mut cancelled = false;
        let count = app.records.iterate(&filter, |record| {
            if terminated.load(Ordering::Relaxed) {
                cancelled = true;
                return Ok(false);
            }
            if let Err(e) = ingestor.renormalize(&record) {
                tracing::warn!("Renormalizing {} failed: {e}", record.id);
            }
            Ok(true)
        })?;
        total += count;
        if cancelled {
            anyhow::bail!("terminated");
        }
        println!("{} {}: {} records renormalized", style("✓").green(), source_id, count);
    }
    println!("\nRenormalized {total} records");
    Ok(())
}

pub async fn cmd_deduplicate(
    app: &App,
    source_id: Option<String>,
    terminated: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut handler = DedupHandler::new(
        &app.records,
        &app.groups,
        &app.settings.sources,
        &app.settings.dedup,
    );
    let stats = handler.deduplicate(source_id.as_deref(), &terminated)?;
    println!(
        "{} Deduplicated {} records: {} matched, {} unmatched",
        style("✓").green(),
        stats.processed,
        stats.matched,
        stats.unmatched
    );
    Ok(())
}

pub async fn cmd_markdeleted(app: &App, source_id: String) -> anyhow::Result<()> {
    let source = app.settings.source(&source_id)?;
    let ingestor = Ingestor::new(source, &app.records, &app.groups)?;

    let live = app.records.find(&RecordFilter::live_source(&source_id))?;
    let count = live.len();
    for record in live {
        ingestor.tombstone(record)?;
    }
    println!("{} Marked {count} records of {source_id} deleted", style("✓").green());
    Ok(())
}

pub async fn cmd_deleterecords(app: &App, source_id: String) -> anyhow::Result<()> {
    app.settings.source(&source_id)?;

    let all = app.records.find(&RecordFilter {
        source_id: Some(source_id.clone()),
        ..Default::default()
    })?;
    let count = all.len();
    for record in all {
        detach_record(&app.records, &app.groups, &record)?;
        app.records.delete(&record.id)?;
    }
    println!("{} Removed {count} records of {source_id} from the store", style("✓").green());
    Ok(())
}

pub struct UpdatesolrArgs {
    pub from: Option<String>,
    pub source: Option<String>,
    pub single: Option<String>,
    pub no_commit: bool,
    pub compare: Option<PathBuf>,
    pub dump_prefix: Option<String>,
}

pub async fn cmd_updatesolr(
    app: &App,
    args: UpdatesolrArgs,
    terminated: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    if let Some(source) = &args.source {
        app.settings.source(source)?;
    }
    let opts = UpdateOptions {
        from: args.from.as_deref().map(parse_date_arg).transpose()?,
        source: args.source,
        single: args.single,
        no_commit: args.no_commit,
        compare: args.compare,
        dump_prefix: args.dump_prefix,
    };

    let mapper = app.mapper()?;
    let updater = app.updater(&mapper, terminated)?;
    let stats = updater.update(&opts).await?;
    println!(
        "{} Solr update: {} documents, {} deletions, {} batches",
        style("✓").green(),
        stats.updated,
        stats.deleted,
        stats.batches
    );
    Ok(())
}

pub async fn cmd_deletesolr(
    app: &App,
    source_id: String,
    terminated: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mapper = app.mapper()?;
    let updater = app.updater(&mapper, terminated)?;
    updater.delete_datasource(&source_id).await?;
    println!("{} Deleted {source_id} from the index", style("✓").green());
    Ok(())
}

pub async fn cmd_optimizesolr(app: &App, terminated: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mapper = app.mapper()?;
    let updater = app.updater(&mapper, terminated)?;
    updater.optimize().await?;
    println!("{} Optimize issued", style("✓").green());
    Ok(())
}

pub async fn cmd_checkdedup(app: &App) -> anyhow::Result<()> {
    let stats = check_dedup_consistency(&app.records, &app.groups)?;
    println!(
        "{} Checked {} groups: {} stale members removed, {} groups collapsed, {} orphans cleared",
        style("✓").green(),
        stats.groups_checked,
        stats.stale_members_removed,
        stats.groups_collapsed,
        stats.orphans_cleared
    );
    Ok(())
}

pub async fn cmd_count(
    app: &App,
    source_id: Option<String>,
    deleted: bool,
) -> anyhow::Result<()> {
    let count = app.records.count(&RecordFilter {
        source_id,
        deleted: Some(deleted),
        ..Default::default()
    })?;
    println!("{count}");
    Ok(())
}

pub async fn cmd_dump(app: &App, id: String) -> anyhow::Result<()> {
    let Some(record) = app.records.get(&id)? else {
        anyhow::bail!("no record with id '{id}'");
    };
    println!("id:        {}", record.id);
    println!("source:    {}", record.source_id);
    println!("format:    {}", record.format);
    println!("oai_id:    {}", record.oai_id);
    println!("deleted:   {}", record.deleted);
    println!("dirty:     {}", record.update_needed);
    println!("dedup_id:  {}", record.dedup_id.as_deref().unwrap_or("-"));
    println!("host:      {}", record.host_record_id);
    println!("updated:   {}", record.updated);
    println!("\n{}", record.payload());
    Ok(())
}

pub async fn cmd_preview(
    app: &App,
    id: String,
    terminated: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mapper = app.mapper()?;
    let updater = app.updater(&mapper, terminated)?;
    let canonical = match app.records.get(&id)? {
        Some(record) => record.dedup_id.unwrap_or(record.id),
        None => id,
    };
    match updater.preview(&canonical).await? {
        Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
        None => anyhow::bail!("nothing to index for '{canonical}'"),
    }
    Ok(())
}
