//! # Bulkport CLI (`bulk`)
//!
//! The `bulk` binary drives the import and export engines from the command
//! line and starts the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! bulk --config ./config/bulk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bulk init` | Create the SQLite database and run schema migrations |
//! | `bulk import <source>` | Import a CSV/NDJSON file or URL and wait for the job |
//! | `bulk export` | Stream every record of a kind to stdout or a file |
//! | `bulk export-job` | Run a filtered export job to a file under `export.output_dir` |
//! | `bulk job import <id>` | Show an import job as JSON |
//! | `bulk job export <id>` | Show an export job as JSON |
//! | `bulk stats` | Entity and job counts |
//! | `bulk serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! bulk init
//! bulk import ./users.csv --resource users --key users-2024-05-01
//! bulk import https://example.com/articles.ndjson --resource articles --key nightly-42
//! bulk export --resource comments --format ndjson > comments.ndjson
//! bulk export-job --resource users --format csv --key admins --filter role=admin --field email
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use bulkport::config::{self, Config};
use bulkport::context::Context;
use bulkport::export::{self, CreateExport, Exporter};
use bulkport::import::{CreateImport, Importer};
use bulkport::jobs::JobStatus;
use bulkport::models::{Format, ResourceKind};
use bulkport::progress::{self, ProgressMode};
use bulkport::source::ImportSource;
use bulkport::{logging, migrate, server, stats};

/// Bulkport: streaming bulk import and export for users, articles and comments.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/bulk.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "bulk",
    about = "Streaming bulk import/export between CSV/NDJSON files and SQLite",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist, everything lives under `./data`.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

const DEFAULT_CONFIG: &str = "./config/bulk.toml";

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Import records from a local file or an http(s) URL.
    ///
    /// Waits for the job to finish and prints it as JSON. Exits non-zero
    /// when the job fails; per-record errors alone do not fail the job.
    Import {
        /// File path or http(s) URL.
        source: String,

        /// Resource kind: `users`, `articles` or `comments`.
        #[arg(long)]
        resource: ResourceKind,

        /// Idempotency key. Repeating a key returns the existing job.
        #[arg(long)]
        key: String,

        /// `csv` or `ndjson`. Detected from the extension when omitted.
        #[arg(long)]
        format: Option<Format>,

        /// Progress output on stderr: `off`, `human` or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// Stream every record of a kind, unfiltered.
    Export {
        #[arg(long)]
        resource: ResourceKind,

        #[arg(long, default_value = "ndjson")]
        format: Format,

        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run a filtered export job and wait for its file.
    ExportJob {
        #[arg(long)]
        resource: ResourceKind,

        #[arg(long)]
        format: Format,

        #[arg(long)]
        key: String,

        /// Equality filter as `column=value`. Repeatable.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,

        /// Field to include. Repeatable; all fields when omitted.
        #[arg(long = "field")]
        fields: Vec<String>,

        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// Show a job.
    Job {
        #[command(subcommand)]
        kind: JobKind,
    },

    /// Show entity and job counts.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum JobKind {
    Import { id: String },
    Export { id: String },
}

/// Parse a `key=value` pair for `--filter` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!(
            "unknown progress mode '{}': expected off, human or json",
            other
        )),
    }
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        return Ok(Config::in_dir(Path::new("./data")));
    }
    config::load_config(path)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    logging::init(&cfg.log)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import {
            source,
            resource,
            key,
            format,
            progress,
        } => {
            let ctx = Context::connect(&cfg).await?;
            let source = if source.starts_with("http://") || source.starts_with("https://") {
                ImportSource::Url(source)
            } else {
                ImportSource::Path(PathBuf::from(source))
            };

            let handle = Importer::new(ctx.clone())
                .create_job(CreateImport {
                    idempotency_key: key,
                    resource,
                    format,
                    source,
                })
                .await?;
            let job_id = handle.job.id.clone();
            if !handle.created {
                eprintln!("Idempotency key already used; showing existing job.");
            }

            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            progress::watch_import(&ctx.jobs, &job_id, handle.task, reporter.as_ref()).await;

            let job = ctx
                .jobs
                .get_import(&job_id)
                .await?
                .with_context(|| format!("import job {} vanished", job_id))?;
            print_json(&job)?;
            if job.status == JobStatus::Failed {
                anyhow::bail!("import job {} failed", job.id);
            }
        }
        Commands::Export {
            resource,
            format,
            output,
        } => {
            let ctx = Context::connect(&cfg).await?;
            let total = match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    export::stream_export(&ctx, resource, format, &mut file).await?
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    export::stream_export(&ctx, resource, format, &mut stdout).await?
                }
            };
            eprintln!("Exported {} {}.", progress::format_number(total), resource);
        }
        Commands::ExportJob {
            resource,
            format,
            key,
            filters,
            fields,
            progress,
        } => {
            let ctx = Context::connect(&cfg).await?;
            let handle = Exporter::new(ctx.clone())
                .create_job(CreateExport {
                    idempotency_key: key,
                    resource,
                    format,
                    filters: filters.into_iter().collect::<BTreeMap<_, _>>(),
                    fields,
                })
                .await?;
            let job_id = handle.job.id.clone();

            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            progress::watch_export(&ctx.jobs, &job_id, handle.task, reporter.as_ref()).await;

            let job = ctx
                .jobs
                .get_export(&job_id)
                .await?
                .with_context(|| format!("export job {} vanished", job_id))?;
            print_json(&job)?;
            if job.status == JobStatus::Failed {
                anyhow::bail!("export job {} failed", job.id);
            }
        }
        Commands::Job { kind } => {
            let ctx = Context::connect(&cfg).await?;
            match kind {
                JobKind::Import { id } => match ctx.jobs.get_import(&id).await? {
                    Some(job) => print_json(&job)?,
                    None => anyhow::bail!("no import job {}", id),
                },
                JobKind::Export { id } => match ctx.jobs.get_export(&id).await? {
                    Some(job) => print_json(&job)?,
                    None => anyhow::bail!("no export job {}", id),
                },
            }
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
