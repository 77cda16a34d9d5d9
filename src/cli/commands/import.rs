//! Import command: ingest or delete records from bulk files.

use console::style;
use std::path::PathBuf;
use tracing::warn;

use super::helpers::App;
use crate::config::DataSourceConfig;
use crate::drivers;
use crate::ingest::{create_splitter, Ingestor};

pub async fn cmd_import(
    app: &App,
    files: Vec<PathBuf>,
    source_id: String,
    delete: bool,
) -> anyhow::Result<()> {
    let source = app.settings.source(&source_id)?;
    let ingestor = Ingestor::new(source, &app.records, &app.groups)?;

    let mut total = 0u64;
    for file in &files {
        let content = std::fs::read_to_string(file)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", file.display()))?;

        let count = if delete {
            delete_from_file(source, app, &ingestor, &content)?
        } else {
            ingestor.store_record("", false, &content)?
        };
        total += count;
        println!(
            "{} {}: {} records {}",
            style("✓").green(),
            file.display(),
            count,
            if delete { "deleted" } else { "imported" }
        );
    }

    println!(
        "\n{total} records {} from {} files",
        if delete { "deleted" } else { "imported" },
        files.len()
    );
    Ok(())
}

/// Resolve the record ids carried by a file and tombstone them.
fn delete_from_file(
    source: &DataSourceConfig,
    app: &App,
    ingestor: &Ingestor<'_>,
    content: &str,
) -> anyhow::Result<u64> {
    let parts = match &source.record_splitter {
        Some(name) => create_splitter(name)?.split(content)?,
        None => vec![content.to_string()],
    };

    let mut deleted = 0;
    for part in parts {
        let driver = drivers::create_driver(
            &source.format,
            &part,
            "",
            &source.id,
            &source.driver_params,
        )?;
        let local_id = driver.id();
        if local_id.is_empty() {
            warn!("Skipping record without id in delete file");
            continue;
        }
        let id = format!("{}.{}", source.id_prefix(), local_id);
        if let Some(record) = app.records.get(&id)? {
            if !record.deleted {
                ingestor.tombstone(record)?;
                deleted += 1;
            }
        }
    }
    Ok(deleted)
}
