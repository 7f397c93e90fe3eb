use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use uuid::Uuid;

use crate::domain::keys::CacheKey;

/// Command-line arguments for the scriptorium binary.
#[derive(Debug, Parser)]
#[command(
    name = "scriptorium",
    version,
    about = "Cache-consistency worker and tooling for the scriptorium blog backend"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SCRIPTORIUM_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the queue processor and cache sweeper until interrupted.
    Worker(Box<WorkerArgs>),
    /// Apply database migrations.
    Migrate(DatabaseArgs),
    /// Enqueue deletion of cache entries.
    Invalidate(InvalidateArgs),
    /// Inspect or requeue tasks that exhausted their retries.
    #[command(name = "dead-tasks")]
    DeadTasks(DeadTasksArgs),
    /// Print per-queue task counts.
    Stats(DatabaseArgs),
    /// Manage cached sessions.
    Session(SessionArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub overrides: WorkerOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the cache backend (memory|postgres).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the queue backend (memory|postgres).
    #[arg(long = "queue-backend", value_name = "BACKEND")]
    pub queue_backend: Option<String>,

    /// Override the number of concurrently processed tasks.
    #[arg(long = "queue-concurrency", value_name = "COUNT")]
    pub queue_concurrency: Option<u32>,

    /// Override how long shutdown waits for in-flight tasks.
    #[arg(long = "queue-shutdown-timeout-seconds", value_name = "SECONDS")]
    pub queue_shutdown_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Article id whose cached entry should be dropped.
    #[arg(long = "article", value_name = "UUID")]
    pub articles: Vec<Uuid>,

    /// Article slug whose cached entry should be dropped.
    #[arg(long = "slug", value_name = "SLUG")]
    pub slugs: Vec<String>,

    /// Subject whose session should be dropped.
    #[arg(long = "session", value_name = "SUBJECT")]
    pub sessions: Vec<String>,
}

impl InvalidateArgs {
    pub fn keys(&self) -> Vec<CacheKey> {
        self.articles
            .iter()
            .map(|id| CacheKey::article(*id))
            .chain(self.slugs.iter().map(|slug| CacheKey::article_slug(slug)))
            .chain(self.sessions.iter().map(|subject| CacheKey::session(subject)))
            .collect()
    }
}

#[derive(Debug, Args, Clone)]
pub struct DeadTasksArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(subcommand)]
    pub command: DeadTasksCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum DeadTasksCommand {
    /// List dead tasks, most recent first.
    List {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Make dead tasks deliverable again.
    Requeue {
        /// Requeue only this task.
        #[arg(long, value_name = "ID", conflicts_with = "all")]
        id: Option<String>,
        /// Requeue every dead task.
        #[arg(long, action = clap::ArgAction::SetTrue)]
        all: bool,
    },
}

#[derive(Debug, Args, Clone)]
pub struct SessionArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(subcommand)]
    pub command: SessionCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum SessionCommand {
    /// Block a subject's session until it expires or the subject logs in again.
    Block {
        #[arg(long, value_name = "SUBJECT")]
        subject: String,
    },
}
