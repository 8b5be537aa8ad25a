//! # Index Release CLI (`ixr`)
//!
//! Operator interface for the product search index lifecycle: build a
//! version into an environment, promote staging to production, inspect
//! history, clean up orphans, and run the admin HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! ixr --config ./config/ixr.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ixr init` | Create the SQLite database and run schema migrations |
//! | `ixr build <env>` | Build a new index version into `staging` or `production` |
//! | `ixr status <task>` | Show a build task |
//! | `ixr promote` | Cut production over to the staging index |
//! | `ixr envs` | Show both environments |
//! | `ixr reset <env>` | Return an environment to INACTIVE |
//! | `ixr history` | Deployment history, newest first |
//! | `ixr orphans` | List (or delete) unreferenced managed resources |
//! | `ixr recover` | Fail work a crashed process left running |
//! | `ixr dict add/list` | Edit dictionary entries |
//! | `ixr guard` | Show who holds the indexing guard |
//! | `ixr serve` | Start the admin HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! ixr init
//! ixr dict add synonym "tv, television"
//! ixr build staging --description "nightly"
//! ixr promote --description "release 42"
//! ixr orphans --delete --confirm
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use index_release::config;
use index_release::history::{HistoryFilter, Page};
use index_release::migrate;
use index_release::progress::{format_number, ProgressMode};
use index_release::server;
use index_release::service::ReleaseService;
use index_release_core::models::{
    DeploymentStatus, DeploymentType, DictionaryKind, EnvironmentType,
};

/// Index Release CLI: blue-green build and release of product search indices.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ixr.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ixr",
    about = "Index Release: blue-green build and release of product search indices",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ixr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Build a new index version into an environment.
    ///
    /// The pipeline runs in this process; the command returns when the
    /// build has finished or failed. Production builds move the live
    /// aliases when they complete.
    Build {
        /// `staging` or `production`.
        #[arg(value_parser = parse_environment)]
        environment: EnvironmentType,

        /// Free-text note stored on the history row.
        #[arg(long)]
        description: Option<String>,

        /// Progress output: `off`, `human`, or `json` (stderr).
        /// Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Show a build task.
    Status {
        /// Task id printed by `ixr build` or returned by `POST /builds`.
        task_id: String,
    },

    /// Promote the ACTIVE staging index to production.
    Promote {
        #[arg(long)]
        description: Option<String>,
    },

    /// Show both environments.
    Envs,

    /// Return an environment to INACTIVE.
    Reset {
        #[arg(value_parser = parse_environment)]
        environment: EnvironmentType,
    },

    /// Deployment history, newest first.
    History {
        /// `indexing`, `deployment`, or `cleanup`.
        #[arg(long = "type")]
        deployment_type: Option<String>,
        /// `in_progress`, `success`, `failed`, or `partial`.
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "env", value_parser = parse_environment)]
        environment: Option<EnvironmentType>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        per_page: u32,
    },

    /// List managed indices and synonym sets nothing references.
    Orphans {
        /// Delete the orphans instead of listing them.
        #[arg(long)]
        delete: bool,
        /// Required together with `--delete`.
        #[arg(long)]
        confirm: bool,
    },

    /// Fail tasks, history rows and environments a crashed process left
    /// running, and release the indexing guard.
    Recover,

    /// Manage dictionary entries (synonyms, user words, stopwords).
    Dict {
        #[command(subcommand)]
        action: DictAction,
    },

    /// Show who holds the indexing guard.
    Guard,

    /// Start the admin HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum DictAction {
    /// Add an entry. Takes effect at the next build.
    Add {
        /// `synonym`, `user_word`, or `stopword`.
        kind: String,
        content: String,
    },
    /// List entries.
    List {
        #[arg(long)]
        kind: Option<String>,
    },
}

fn parse_environment(s: &str) -> Result<EnvironmentType, String> {
    s.parse::<EnvironmentType>().map_err(|e| e.to_string())
}

fn parse_progress(raw: Option<&str>) -> Result<ProgressMode> {
    Ok(match raw {
        None => ProgressMode::default_for_tty(),
        Some("off") => ProgressMode::Off,
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some(other) => bail!("Unknown progress mode: '{}'. Use off, human or json.", other),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,index_release=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        command => {
            let service = ReleaseService::from_config(&cfg).await?;
            run_command(&service, command).await?;
        }
    }

    Ok(())
}

async fn run_command(service: &ReleaseService, command: Commands) -> Result<()> {
    match command {
        Commands::Build {
            environment,
            description,
            progress,
        } => {
            let mode = parse_progress(progress.as_deref())?;
            run_build(service, environment, description, mode).await?;
        }
        Commands::Status { task_id } => {
            let task = service.build_status(&task_id).await?;
            println!("Task {}", task.id);
            println!("  environment: {}", task.environment_type);
            println!("  version:     {}", task.version);
            println!("  status:      {}", task.status);
            println!("  progress:    {}%", task.progress_percent);
            println!("  message:     {}", task.message);
            if let Some(result) = &task.result {
                println!("  result:      {}", result);
            }
        }
        Commands::Promote { description } => {
            let outcome = service.promote(description).await?;
            println!(
                "Promoted {} to production ({} documents).",
                outcome.version,
                format_number(outcome.document_count.max(0) as u64)
            );
            println!("  primary:      {}", outcome.production.primary);
            println!("  autocomplete: {}", outcome.production.autocomplete);
            if !outcome.cleanup.deleted.is_empty() {
                println!("  deleted:      {}", outcome.cleanup.deleted.join(", "));
            }
            for (name, reason) in &outcome.cleanup.failed {
                println!("  not deleted:  {} ({})", name, reason);
            }
        }
        Commands::Envs => {
            for env in service.list_environments().await? {
                println!(
                    "{:<11} {:<9} {:<16} docs={:<9} primary={} autocomplete={}",
                    env.environment_type.as_str(),
                    env.index_status.as_str(),
                    env.version.as_deref().unwrap_or("-"),
                    format_number(env.document_count.max(0) as u64),
                    env.primary_index_name.as_deref().unwrap_or("-"),
                    env.autocomplete_index_name.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Reset { environment } => {
            let env = service.reset_environment(environment).await?;
            println!("{} is now {}.", env.environment_type, env.index_status);
        }
        Commands::History {
            deployment_type,
            status,
            environment,
            page,
            per_page,
        } => {
            let filter = HistoryFilter {
                deployment_type: deployment_type
                    .as_deref()
                    .map(str::parse::<DeploymentType>)
                    .transpose()?,
                status: status
                    .as_deref()
                    .map(str::parse::<DeploymentStatus>)
                    .transpose()?,
                environment_type: environment,
                version: None,
            };
            let result = service
                .list_history(&filter, Page { page, per_page })
                .await?;
            for h in &result.items {
                println!(
                    "#{:<5} {} {:<10} {:<11} {:<11} {:<16} docs={}{}",
                    h.id,
                    h.created_at.format("%Y-%m-%d %H:%M:%S"),
                    h.deployment_type.as_str(),
                    h.environment_type.map(|e| e.as_str()).unwrap_or("-"),
                    h.status.as_str(),
                    h.version.as_deref().unwrap_or("-"),
                    h.document_count,
                    h.error_message
                        .as_deref()
                        .map(|m| format!("  error: {}", m))
                        .unwrap_or_default(),
                );
            }
            println!(
                "page {} of {} rows ({} per page)",
                result.page, result.total, result.per_page
            );
        }
        Commands::Orphans { delete, confirm } => {
            if delete && confirm {
                let report = service.delete_orphans(true).await?;
                if report.history_id.is_none() {
                    println!("No orphans to delete.");
                } else {
                    println!("Deleted {} resource(s).", report.deleted.len());
                    for (name, reason) in &report.failed {
                        println!("  failed: {} ({})", name, reason);
                    }
                }
            } else {
                let report = service.find_orphans().await?;
                if report.is_empty() {
                    println!("No orphans.");
                }
                for name in &report.orphan_indices {
                    println!("index        {}", name);
                }
                for name in &report.orphan_synonym_sets {
                    println!("synonym set  {}", name);
                }
                if delete && !report.is_empty() {
                    println!("Nothing deleted: pass --confirm together with --delete.");
                }
            }
        }
        Commands::Recover => {
            let report = service.recover().await?;
            println!(
                "Recovered: {} task(s), {} history row(s), {} environment(s) failed.",
                report.tasks_failed, report.history_failed, report.environments_failed
            );
            if let Some(holder) = report.released_holder {
                println!("Released indexing guard held by {}.", holder);
            }
        }
        Commands::Dict { action } => match action {
            DictAction::Add { kind, content } => {
                let kind: DictionaryKind = kind.parse()?;
                let entry = service.add_dictionary_entry(kind, &content).await?;
                println!("#{} {} {}", entry.id, entry.kind, entry.content);
            }
            DictAction::List { kind } => {
                let kind = kind.as_deref().map(str::parse::<DictionaryKind>).transpose()?;
                for entry in service.list_dictionary_entries(kind).await? {
                    println!("#{:<5} {:<9} {}", entry.id, entry.kind.as_str(), entry.content);
                }
            }
        },
        Commands::Guard => match service.guard_status().await? {
            Some(g) => println!(
                "Held by {} ({}{}) since {}",
                g.holder,
                g.purpose,
                g.environment_type
                    .map(|e| format!(", {}", e))
                    .unwrap_or_default(),
                g.acquired_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("Guard is free."),
        },
        Commands::Init | Commands::Serve => unreachable!("handled before the service is built"),
    }
    Ok(())
}

async fn run_build(
    service: &ReleaseService,
    environment: EnvironmentType,
    description: Option<String>,
    mode: ProgressMode,
) -> Result<()> {
    let handle = service.start_build(environment, description).await?;
    let task_id = handle.task_id.clone();
    println!("Build {} started: {} {}", task_id, environment, handle.version);

    let reporter = mode.reporter();
    let finished = handle.wait();
    tokio::pin!(finished);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut last_seen: Option<(u8, String)> = None;

    let result = loop {
        tokio::select! {
            res = &mut finished => break res,
            _ = ticker.tick() => {
                if let Ok(task) = service.build_status(&task_id).await {
                    let key = (task.progress_percent, task.message.clone());
                    if last_seen.as_ref() != Some(&key) {
                        reporter.report(&task);
                        last_seen = Some(key);
                    }
                }
            }
        }
    };

    if let Ok(task) = service.build_status(&task_id).await {
        reporter.report(&task);
    }
    let summary = result?;
    println!(
        "Build complete: {} {} with {} documents.",
        summary.environment,
        summary.version,
        format_number(summary.document_count)
    );
    println!("  primary:      {}", summary.names.primary);
    println!("  autocomplete: {}", summary.names.autocomplete);
    if summary.cut_over {
        println!("  aliases now point at this version.");
    }
    Ok(())
}
