//! Datasources command: list configured sources and their state.

use console::style;
use regex::Regex;

use super::helpers::App;
use crate::models::{last_harvest_date_key, RecordFilter};

pub async fn cmd_datasources(app: &App, search: Option<String>) -> anyhow::Result<()> {
    let pattern = search
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| anyhow::anyhow!("bad search pattern: {e}"))?;

    let mut ids: Vec<&String> = app.settings.sources.keys().collect();
    ids.sort();

    let mut shown = 0;
    for id in ids {
        if let Some(pattern) = &pattern {
            if !pattern.is_match(id) {
                continue;
            }
        }
        shown += 1;
        let source = &app.settings.sources[id];

        let live = app.records.count(&RecordFilter::live_source(id))?;
        let deleted = app.records.count(&RecordFilter {
            source_id: Some(id.clone()),
            deleted: Some(true),
            ..Default::default()
        })?;
        let last_harvest = app
            .state
            .get(&last_harvest_date_key(id))?
            .unwrap_or_else(|| "never".to_string());

        println!("\n{}", style(id).bold());
        println!("{}", "-".repeat(40));
        println!("{:<16} {}", "Format:", source.format);
        println!("{:<16} {}", "Type:", source.source_type.as_str());
        if !source.url.is_empty() {
            println!("{:<16} {}", "URL:", source.url);
        }
        println!("{:<16} {}", "Institution:", source.institution);
        println!("{:<16} {}", "Dedup:", if source.dedup { "yes" } else { "no" });
        println!("{:<16} {live} live, {deleted} deleted", "Records:");
        println!("{:<16} {last_harvest}", "Last harvest:");
    }

    if shown == 0 {
        println!("{} No matching data sources", style("!").yellow());
    }
    Ok(())
}
