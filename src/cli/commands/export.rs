//! Export command: write stored records out as JSON lines.

use console::style;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

use super::helpers::App;
use crate::models::RecordFilter;
use crate::utils::parse_date_arg;

/// When to include the dedup group id in exported lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum AddDedupId {
    /// Only on records that belong to a group.
    #[default]
    Deduped,
    /// On every record, empty when ungrouped.
    Always,
}

pub struct ExportArgs {
    pub file: PathBuf,
    pub deleted: Option<PathBuf>,
    pub from: Option<String>,
    pub skip: Option<u64>,
    pub source: Option<String>,
    pub single: Option<String>,
    pub sort_dedup: bool,
    pub add_dedup_id: Option<AddDedupId>,
}

pub async fn cmd_export(app: &App, args: ExportArgs) -> anyhow::Result<()> {
    let filter = RecordFilter {
        source_id: args.source.clone(),
        updated_since: args.from.as_deref().map(parse_date_arg).transpose()?,
        ..Default::default()
    };

    let mut out = std::fs::File::create(&args.file)
        .map_err(|e| anyhow::anyhow!("cannot create {}: {e}", args.file.display()))?;
    let mut deleted_out = args
        .deleted
        .as_ref()
        .map(std::fs::File::create)
        .transpose()
        .map_err(|e| anyhow::anyhow!("cannot create deleted-id file: {e}"))?;

    let mut records = match &args.single {
        Some(id) => app.records.get(id)?.into_iter().collect(),
        None => app.records.find(&filter)?,
    };
    if args.sort_dedup {
        records.sort_by(|a, b| {
            (a.dedup_id.as_deref().unwrap_or(""), &a.id)
                .cmp(&(b.dedup_id.as_deref().unwrap_or(""), &b.id))
        });
    }

    let step = args.skip.unwrap_or(0) + 1;
    let mut exported = 0u64;
    let mut tombstones = 0u64;
    for (index, record) in records.iter().enumerate() {
        if record.deleted {
            if let Some(out) = deleted_out.as_mut() {
                writeln!(out, "{}", record.id)?;
                tombstones += 1;
            }
            continue;
        }
        if index as u64 % step != 0 {
            continue;
        }

        let mut line = json!({
            "id": record.id,
            "source": record.source_id,
            "format": record.format,
            "data": record.payload(),
        });
        match args.add_dedup_id {
            Some(AddDedupId::Deduped) => {
                if let Some(dedup_id) = &record.dedup_id {
                    line["dedup_id"] = json!(dedup_id);
                }
            }
            Some(AddDedupId::Always) => {
                line["dedup_id"] = json!(record.dedup_id.clone().unwrap_or_default());
            }
            None => {}
        }
        writeln!(out, "{line}")?;
        exported += 1;
    }

    println!(
        "{} Exported {} records to {} ({} deleted ids)",
        style("✓").green(),
        exported,
        args.file.display(),
        tombstones
    );
    Ok(())
}
