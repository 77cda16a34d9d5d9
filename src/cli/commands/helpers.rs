//! Shared command helpers: settings loading and repository wiring.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;

use crate::config::Settings;
use crate::enrich::{AuthorityEnricher, Enricher};
use crate::harvest::RetryingClient;
use crate::mapper::FieldMapper;
use crate::repository::{
    run_all_migrations, DedupRepository, QueueRepository, RecordRepository, StateRepository,
    UriCacheRepository,
};
use crate::solr::SolrUpdater;

/// Loaded settings plus open repositories, shared by every command.
pub struct App {
    pub settings: Settings,
    pub records: RecordRepository,
    pub groups: DedupRepository,
    pub state: StateRepository,
    pub queues: QueueRepository,
    pub uri_cache: UriCacheRepository,
}

impl App {
    pub fn load(config: Option<&Path>) -> anyhow::Result<Self> {
        let settings = Settings::load(config)?;
        let db_path = settings.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let tables = run_all_migrations(&db_path)?;
        tracing::debug!("Record store ready with {} tables", tables.len());

        let records = RecordRepository::new(&db_path)?;
        let groups = DedupRepository::new(&db_path)?;
        let state = StateRepository::new(&db_path)?;
        let queues = QueueRepository::new(&db_path)?;
        let uri_cache = UriCacheRepository::new(&db_path)?;

        Ok(Self {
            settings,
            records,
            groups,
            state,
            queues,
            uri_cache,
        })
    }

    /// Build the field mapper from the configured mapping files.
    pub fn mapper(&self) -> anyhow::Result<FieldMapper> {
        Ok(FieldMapper::load(
            &self.settings.mappings_dir(),
            &self.settings.sources,
        )?)
    }

    /// Wire up the Solr update pipeline with the configured enrichers.
    pub fn updater<'a>(
        &'a self,
        mapper: &'a FieldMapper,
        terminated: Arc<AtomicBool>,
    ) -> anyhow::Result<SolrUpdater<'a>> {
        let mut enrichers: Vec<Box<dyn Enricher + 'a>> = Vec::new();
        if self.settings.enrichment.enabled {
            let client = RetryingClient::new(&self.settings.http, Vec::new())?;
            enrichers.push(Box::new(AuthorityEnricher::new(
                &self.uri_cache,
                client,
                &self.settings.enrichment,
            )));
        }

        Ok(SolrUpdater::new(
            &self.settings,
            &self.records,
            &self.groups,
            &self.queues,
            &self.state,
            mapper,
            enrichers,
            terminated,
        )?)
    }
}
