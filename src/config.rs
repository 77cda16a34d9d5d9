//! Configuration management for bibfuse.
//!
//! Two files: `bibfuse.toml` carries the site-wide settings (database,
//! Solr, HTTP, enrichment) and `datasources.toml` one table per data
//! source. Config problems are fatal at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Mapping file flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingKind {
    Normal,
    Regexp,
    RegexpMulti,
}

/// One mapping file attached to a field, written in config as
/// `"filename"` or `"filename,kind"`.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub file: String,
    pub kind: MappingKind,
}

impl MappingEntry {
    fn parse(spec: &str) -> Result<Self> {
        let (file, kind) = match spec.split_once(',') {
            Some((file, kind)) => (file.trim(), kind.trim()),
            None => (spec.trim(), "normal"),
        };
        let kind = match kind {
            "normal" => MappingKind::Normal,
            "regexp" => MappingKind::Regexp,
            "regexp-multi" => MappingKind::RegexpMulti,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown mapping type '{other}' in '{spec}'"
                )))
            }
        };
        Ok(Self {
            file: file.to_string(),
            kind,
        })
    }
}

/// Harvest protocol of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[serde(rename = "oai-pmh")]
    OaiPmh,
    Sierra,
    Sfx,
    Metalib,
    MetalibExport,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OaiPmh => "oai-pmh",
            Self::Sierra => "sierra",
            Self::Sfx => "sfx",
            Self::Metalib => "metalib",
            Self::MetalibExport => "metalib_export",
        }
    }

    /// Whether the protocol reports deletions itself (incremental deletes).
    pub fn reports_deletions(&self) -> bool {
        matches!(self, Self::OaiPmh | Self::Sierra)
    }
}

/// Component-part handling when building Solr documents for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentPartsPolicy {
    /// Index component parts as independent documents.
    #[default]
    AsIs,
    /// Fold all component parts into the host document.
    MergeAll,
    /// Fold everything except article-like parts.
    MergeNonArticles,
}

/// Deletion reconciliation mode for sources whose protocol does not report
/// deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionMode {
    /// `ListIdentifiers` mark/sweep, at most once per `min_interval_days`.
    ListIdentifiers { min_interval_days: u32 },
}

fn default_true() -> bool {
    true
}

/// Per-source configuration from `datasources.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceConfig {
    /// Assigned when the tables are read; not present in the file itself.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub url: String,
    pub format: String,
    #[serde(default)]
    pub institution: String,
    #[serde(rename = "type", default = "default_source_type")]
    pub source_type: SourceType,
    /// Record id prefix; defaults to the source id.
    #[serde(default)]
    pub id_prefix: Option<String>,
    /// OAI-PMH metadata prefix.
    #[serde(default)]
    pub metadata_prefix: Option<String>,
    /// OAI-PMH set specifier.
    #[serde(default)]
    pub set: Option<String>,
    /// Deduplication enabled for this source.
    #[serde(default = "default_true")]
    pub dedup: bool,
    #[serde(default)]
    pub component_parts: ComponentPartsPolicy,
    /// Also index component parts that were merged into their host.
    #[serde(default)]
    pub index_merged_parts: bool,
    /// Named record splitter plugin.
    #[serde(default)]
    pub record_splitter: Option<String>,
    /// Keep hierarchy members that vanish from a re-ingested batch.
    #[serde(default)]
    pub keep_missing_hierarchy_members: bool,
    /// Deletion reconciliation, e.g. `"ListIdentifiers"` or
    /// `"ListIdentifiers:14"`.
    #[serde(default)]
    pub deletions: Option<String>,
    /// Safety offset subtracted from harvest windows, in seconds.
    #[serde(default)]
    pub harvest_offset_secs: Option<i64>,
    /// HTTP status codes to treat as ignorable during harvest.
    #[serde(default)]
    pub ignore_http_errors: Vec<u16>,
    /// Extra driver parameters, passed through opaquely.
    #[serde(default)]
    pub driver_params: HashMap<String, String>,
    /// Solr collection value for this source's documents.
    #[serde(default)]
    pub collection: Option<String>,
    /// Field name -> mapping file specs (`"file"` or `"file,kind"`).
    #[serde(default, rename = "field_mappings")]
    pub raw_field_mappings: HashMap<String, Vec<String>>,
    #[serde(skip)]
    pub field_mappings: HashMap<String, Vec<MappingEntry>>,
}

fn default_source_type() -> SourceType {
    SourceType::OaiPmh
}

impl DataSourceConfig {
    /// Record id prefix for this source.
    pub fn id_prefix(&self) -> &str {
        self.id_prefix.as_deref().unwrap_or(&self.id)
    }

    /// Parsed deletion reconciliation mode, if configured.
    pub fn deletion_mode(&self) -> Result<Option<DeletionMode>> {
        let Some(spec) = &self.deletions else {
            return Ok(None);
        };
        let (mode, interval) = match spec.split_once(':') {
            Some((mode, interval)) => (
                mode,
                interval.parse().map_err(|_| {
                    ConfigError::Invalid(format!("bad deletion interval in '{spec}'"))
                })?,
            ),
            None => (spec.as_str(), 7),
        };
        match mode {
            "ListIdentifiers" => Ok(Some(DeletionMode::ListIdentifiers {
                min_interval_days: interval,
            })),
            other => Err(ConfigError::Invalid(format!(
                "unknown deletion mode '{other}'"
            ))),
        }
    }
}

/// Site-wide identity defaults applied to every Solr document.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_institution")]
    pub default_institution: String,
    #[serde(default = "default_collection")]
    pub default_collection: String,
}

fn default_institution() -> String {
    "Unknown".to_string()
}

fn default_collection() -> String {
    "Catalog".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            default_institution: default_institution(),
            default_collection: default_collection(),
        }
    }
}

/// Record store location.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "bibfuse.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Solr connection and batching settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SolrConfig {
    #[serde(default = "default_solr_url")]
    pub update_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Flush after this many buffered documents.
    #[serde(default = "default_max_update_records")]
    pub max_update_records: usize,
    /// Flush after this many buffered bytes.
    #[serde(default = "default_max_update_size")]
    pub max_update_size: usize,
    /// Issue an explicit commit every this many records.
    #[serde(default = "default_max_commit_interval")]
    pub max_commit_interval: usize,
    /// Explode `building` values into hierarchy facet levels.
    #[serde(default)]
    pub building_hierarchy: bool,
}

fn default_solr_url() -> String {
    "http://localhost:8983/solr/biblio/update/json".to_string()
}

fn default_max_update_records() -> usize {
    5000
}

fn default_max_update_size() -> usize {
    1024 * 1024
}

fn default_max_commit_interval() -> usize {
    50000
}

impl Default for SolrConfig {
    fn default() -> Self {
        Self {
            update_url: default_solr_url(),
            username: None,
            password: None,
            max_update_records: default_max_update_records(),
            max_update_size: default_max_update_size(),
            max_commit_interval: default_max_commit_interval(),
            building_hierarchy: false,
        }
    }
}

/// HTTP retry budget shared by harvesters, enrichment and the Solr client.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// Baseline wait between retries, doubled per attempt up to 30 s.
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_tries() -> u32 {
    5
}

fn default_retry_wait_secs() -> u64 {
    5
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_tries: default_max_tries(),
            retry_wait_secs: default_retry_wait_secs(),
        }
    }
}

/// Enrichment lookup settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub enabled: bool,
    /// URI cache validity in seconds.
    #[serde(default = "default_cache_expiration_secs")]
    pub cache_expiration_secs: i64,
}

fn default_cache_expiration_secs() -> i64 {
    7 * 24 * 3600
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_expiration_secs: default_cache_expiration_secs(),
        }
    }
}

/// Dedup engine tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Skip a blocking key once it matches more candidates than this.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: u64,
    /// Bounded size of the per-pass over-broad-key set.
    #[serde(default = "default_too_many_cache_size")]
    pub too_many_cache_size: usize,
}

fn default_max_candidates() -> u64 {
    1000
}

fn default_too_many_cache_size() -> usize {
    20000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_max_candidates(),
            too_many_cache_size: default_too_many_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MainFile {
    #[serde(default)]
    site: SiteConfig,
    #[serde(default)]
    database: DatabaseConfig,
    #[serde(default)]
    solr: SolrConfig,
    #[serde(default)]
    http: HttpConfig,
    #[serde(default)]
    enrichment: EnrichmentConfig,
    #[serde(default)]
    dedup: DedupConfig,
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: HashMap<String, DataSourceConfig>,
}

/// Fully loaded and validated settings.
#[derive(Debug)]
pub struct Settings {
    pub site: SiteConfig,
    pub database: DatabaseConfig,
    pub solr: SolrConfig,
    pub http: HttpConfig,
    pub enrichment: EnrichmentConfig,
    pub dedup: DedupConfig,
    pub sources: HashMap<String, DataSourceConfig>,
    /// Directory the config was loaded from; relative paths resolve here.
    pub base_dir: PathBuf,
}

impl Settings {
    /// Load settings, discovering the config file when no explicit path is
    /// given: `./bibfuse.toml`, then the user config directory.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let main_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::discover()?,
        };
        let base_dir = main_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let main: MainFile = Self::read_toml(&main_path)?;
        let sources_path = base_dir.join("datasources.toml");
        let mut sources = if sources_path.exists() {
            Self::read_toml::<SourcesFile>(&sources_path)?.sources
        } else {
            HashMap::new()
        };

        for (id, source) in sources.iter_mut() {
            source.id = id.clone();
            let mut parsed = HashMap::new();
            for (field, specs) in &source.raw_field_mappings {
                let mut entries = Vec::new();
                for spec in specs {
                    entries.push(MappingEntry::parse(spec)?);
                }
                parsed.insert(field.clone(), entries);
            }
            source.field_mappings = parsed;
            // fail early on malformed deletion specs
            source.deletion_mode()?;
        }

        Ok(Self {
            site: main.site,
            database: main.database,
            solr: main.solr,
            http: main.http,
            enrichment: main.enrichment,
            dedup: main.dedup,
            sources,
            base_dir,
        })
    }

    fn discover() -> Result<PathBuf> {
        let local = PathBuf::from("bibfuse.toml");
        if local.exists() {
            return Ok(local);
        }
        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("bibfuse").join("bibfuse.toml");
            if user.exists() {
                return Ok(user);
            }
        }
        Err(ConfigError::Invalid(
            "no bibfuse.toml found; pass --config".to_string(),
        ))
    }

    fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: display.clone(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: display,
            source: e,
        })
    }

    /// Absolute record store path, `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.database.path).into_owned();
        let path = PathBuf::from(expanded);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    /// Directory holding the mapping files.
    pub fn mappings_dir(&self) -> PathBuf {
        self.base_dir.join("mappings")
    }

    /// Look up a source or fail with a config error.
    pub fn source(&self, source_id: &str) -> Result<&DataSourceConfig> {
        self.sources
            .get(source_id)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown data source '{source_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_entry_parse() {
        let entry = MappingEntry::parse("building.map").unwrap();
        assert_eq!(entry.file, "building.map");
        assert_eq!(entry.kind, MappingKind::Normal);

        let entry = MappingEntry::parse("format.map,regexp-multi").unwrap();
        assert_eq!(entry.kind, MappingKind::RegexpMulti);

        assert!(MappingEntry::parse("x.map,bogus").is_err());
    }

    #[test]
    fn test_source_defaults() {
        let source: DataSourceConfig = toml::from_str(r#"format = "marc""#).unwrap();
        assert_eq!(source.source_type, SourceType::OaiPmh);
        assert!(source.dedup);
        assert_eq!(source.component_parts, ComponentPartsPolicy::AsIs);
        assert!(source.deletion_mode().unwrap().is_none());
    }

    #[test]
    fn test_deletion_mode_parse() {
        let mut source: DataSourceConfig = toml::from_str(r#"format = "marc""#).unwrap();
        source.deletions = Some("ListIdentifiers:14".into());
        assert_eq!(
            source.deletion_mode().unwrap(),
            Some(DeletionMode::ListIdentifiers {
                min_interval_days: 14
            })
        );

        source.deletions = Some("Bogus".into());
        assert!(source.deletion_mode().is_err());
    }

    #[test]
    fn test_settings_from_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("bibfuse.toml"),
            r#"
[solr]
update_url = "http://solr:8983/solr/biblio/update/json"
building_hierarchy = true

[http]
max_tries = 3
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("datasources.toml"),
            r#"
[sources.helmet]
url = "https://helmet.example.org/oai"
format = "marc"
institution = "Helmet"
type = "oai-pmh"
deletions = "ListIdentifiers:14"

[sources.helmet.field_mappings]
building = ["helmet_building_l0.map", "helmet_building_l1.map"]
format = ["helmet_format.map,regexp"]
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&dir.path().join("bibfuse.toml"))).unwrap();
        assert!(settings.solr.building_hierarchy);
        assert_eq!(settings.http.max_tries, 3);

        let source = settings.source("helmet").unwrap();
        assert_eq!(source.id, "helmet");
        assert_eq!(source.id_prefix(), "helmet");
        assert_eq!(source.field_mappings["building"].len(), 2);
        assert_eq!(source.field_mappings["format"][0].kind, MappingKind::Regexp);
        assert!(settings.source("nope").is_err());
    }
}
