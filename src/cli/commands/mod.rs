//! CLI parser and command dispatch.

mod datasources;
mod export;
mod harvest;
mod helpers;
mod import;
mod manage;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use helpers::App;

#[derive(Parser)]
#[command(name = "bib")]
#[command(about = "Bibliographic metadata aggregation, deduplication and search indexing")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest records from configured sources
    Harvest {
        /// Source to harvest; all sources when omitted
        #[arg(long)]
        source: Option<String>,
        /// Window start (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        from: Option<String>,
        /// Window end
        #[arg(long)]
        until: Option<String>,
        /// Resume from an explicit resumption token
        #[arg(long)]
        resumption: Option<String>,
        /// Comma-separated sources to skip
        #[arg(long)]
        exclude: Option<String>,
        /// Full reharvest, optionally starting at DATE
        #[arg(long, value_name = "DATE", num_args = 0..=1, default_missing_value = "")]
        reharvest: Option<String>,
    },

    /// Import records from files
    Import {
        /// Files to import
        #[arg(long, required = true, num_args = 1..)]
        file: Vec<PathBuf>,
        /// Target data source
        #[arg(long)]
        source: String,
        /// Mark the records in the files deleted instead of importing
        #[arg(long)]
        delete: bool,
    },

    /// Export stored records to a file
    Export {
        /// Output file (JSON lines)
        #[arg(long)]
        file: PathBuf,
        /// Write deleted record ids to this file
        #[arg(long)]
        deleted: Option<PathBuf>,
        /// Only records updated at or after this date
        #[arg(long)]
        from: Option<String>,
        /// Skip this many records between exported ones
        #[arg(long)]
        skip: Option<u64>,
        /// Restrict to one source
        #[arg(long)]
        source: Option<String>,
        /// Export a single record id
        #[arg(long)]
        single: Option<String>,
        /// Order output by dedup group
        #[arg(long)]
        sort_dedup: bool,
        /// Include dedup group ids in the output
        #[arg(long, value_enum)]
        add_dedup_id: Option<export::AddDedupId>,
    },

    /// Maintenance operations
    Manage {
        #[command(subcommand)]
        func: ManageCommands,
    },

    /// List configured data sources
    Datasources {
        /// Filter source ids by regular expression
        #[arg(long)]
        search: Option<String>,
    },
}

#[derive(Subcommand)]
enum ManageCommands {
    /// Re-run normalization over stored original payloads
    Renormalize {
        #[arg(long)]
        source: Option<String>,
    },
    /// Run the deduplication pass over dirty records
    Deduplicate {
        #[arg(long)]
        source: Option<String>,
    },
    /// Soft-delete all records of a source
    Markdeleted {
        #[arg(long)]
        source: String,
    },
    /// Remove all records of a source from the store
    Deleterecords {
        #[arg(long)]
        source: String,
    },
    /// Delete a source's documents from the Solr index
    Deletesolr {
        #[arg(long)]
        source: String,
    },
    /// Run the Solr update pipeline
    Updatesolr {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        source: Option<String>,
        /// Update a single record id
        #[arg(long)]
        single: Option<String>,
        /// Skip the explicit commits
        #[arg(long)]
        no_commit: bool,
        /// Diff against the live index into FILE instead of posting
        #[arg(long, value_name = "FILE")]
        compare: Option<PathBuf>,
        /// Write batches to files with this prefix instead of posting
        #[arg(long, value_name = "PREFIX")]
        dump_prefix: Option<String>,
    },
    /// Issue a Solr optimize
    Optimizesolr,
    /// Verify and repair dedup group consistency
    Checkdedup,
    /// Count records
    Count {
        #[arg(long)]
        source: Option<String>,
        /// Count tombstones instead of live records
        #[arg(long)]
        deleted: bool,
    },
    /// Print one stored record
    Dump {
        #[arg(long)]
        id: String,
    },
    /// Render the index document for one record without posting
    Preview {
        #[arg(long)]
        id: String,
    },
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let app = App::load(cli.config.as_deref())?;
    let terminated = crate::utils::termination_flag();

    match cli.command {
        Commands::Harvest {
            source,
            from,
            until,
            resumption,
            exclude,
            reharvest,
        } => {
            harvest::cmd_harvest(
                &app,
                harvest::HarvestArgs {
                    source,
                    from,
                    until,
                    resumption,
                    exclude,
                    reharvest,
                },
                terminated,
            )
            .await
        }
        Commands::Import {
            file,
            source,
            delete,
        } => import::cmd_import(&app, file, source, delete).await,
        Commands::Export {
            file,
            deleted,
            from,
            skip,
            source,
            single,
            sort_dedup,
            add_dedup_id,
        } => {
            export::cmd_export(
                &app,
                export::ExportArgs {
                    file,
                    deleted,
                    from,
                    skip,
                    source,
                    single,
                    sort_dedup,
                    add_dedup_id,
                },
            )
            .await
        }
        Commands::Manage { func } => match func {
            ManageCommands::Renormalize { source } => {
                manage::cmd_renormalize(&app, source, terminated).await
            }
            ManageCommands::Deduplicate { source } => {
                manage::cmd_deduplicate(&app, source, terminated).await
            }
            ManageCommands::Markdeleted { source } => manage::cmd_markdeleted(&app, source).await,
            ManageCommands::Deleterecords { source } => {
                manage::cmd_deleterecords(&app, source).await
            }
            ManageCommands::Deletesolr { source } => {
                manage::cmd_deletesolr(&app, source, terminated).await
            }
            ManageCommands::Updatesolr {
                from,
                source,
                single,
                no_commit,
                compare,
                dump_prefix,
            } => {
                manage::cmd_updatesolr(
                    &app,
                    manage::UpdatesolrArgs {
                        from,
                        source,
                        single,
                        no_commit,
                        compare,
                        dump_prefix,
                    },
                    terminated,
                )
                .await
            }
            ManageCommands::Optimizesolr => manage::cmd_optimizesolr(&app, terminated).await,
            ManageCommands::Checkdedup => manage::cmd_checkdedup(&app).await,
            ManageCommands::Count { source, deleted } => {
                manage::cmd_count(&app, source, deleted).await
            }
            ManageCommands::Dump { id } => manage::cmd_dump(&app, id).await,
            ManageCommands::Preview { id } => manage::cmd_preview(&app, id, terminated).await,
        },
        Commands::Datasources { search } => datasources::cmd_datasources(&app, search).await,
    }
}
