//! Harvest command: run the incremental harvesters.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::helpers::App;
use crate::harvest::{Harvester, HarvestOptions, HarvestStats};
use crate::ingest::Ingestor;
use crate::utils::parse_date_arg;

pub struct HarvestArgs {
    pub source: Option<String>,
    pub from: Option<String>,
    pub until: Option<String>,
    pub resumption: Option<String>,
    pub exclude: Option<String>,
    pub reharvest: Option<String>,
}

pub async fn cmd_harvest(
    app: &App,
    args: HarvestArgs,
    terminated: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let opts = HarvestOptions {
        from: args.from.as_deref().map(parse_date_arg).transpose()?,
        until: args.until.as_deref().map(parse_date_arg).transpose()?,
        resumption: args.resumption.clone(),
        reharvest: match args.reharvest.as_deref() {
            None => None,
            Some("") => Some(None),
            Some(date) => Some(Some(parse_date_arg(date)?)),
        },
    };

    let excluded: Vec<&str> = args
        .exclude
        .as_deref()
        .map(|list| list.split(',').map(str::trim).collect())
        .unwrap_or_default();

    let mut source_ids: Vec<String> = match &args.source {
        Some(source) => {
            app.settings.source(source)?;
            vec![source.clone()]
        }
        None => {
            let mut ids: Vec<String> = app
                .settings
                .sources
                .values()
                .filter(|s| !s.url.is_empty())
                .map(|s| s.id.clone())
                .collect();
            ids.sort();
            ids
        }
    };
    source_ids.retain(|id| !excluded.contains(&id.as_str()));

    if source_ids.is_empty() {
        println!("{} No sources to harvest", style("!").yellow());
        return Ok(());
    }

    let bar = ProgressBar::new(source_ids.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .expect("valid progress template"),
    );

    let mut total = HarvestStats::default();
    for source_id in &source_ids {
        if terminated.load(Ordering::Relaxed) {
            anyhow::bail!("terminated");
        }
        bar.set_message(source_id.clone());
        let source = app.settings.source(source_id)?;
        let ingestor = Ingestor::new(source, &app.records, &app.groups)?;
        let harvester = Harvester::new(
            source,
            &app.settings.http,
            &app.records,
            &app.state,
            &ingestor,
            Arc::clone(&terminated),
        )?;

        match harvester.harvest(&opts).await {
            Ok(stats) => {
                bar.println(format!(
                    "{} {}: {} records, {} deletions, {} skipped",
                    style("✓").green(),
                    source_id,
                    stats.harvested,
                    stats.deleted,
                    stats.skipped
                ));
                total.harvested += stats.harvested;
                total.deleted += stats.deleted;
                total.skipped += stats.skipped;
            }
            Err(e) => {
                // one broken source must not block the others
                bar.println(format!("{} {source_id}: {e}", style("✗").red()));
                if args.source.is_some() || source_ids.len() == 1 {
                    bar.finish_and_clear();
                    return Err(e.into());
                }
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!(
        "\nHarvested {} records ({} deletions) from {} sources",
        total.harvested,
        total.deleted,
        source_ids.len()
    );
    Ok(())
}
