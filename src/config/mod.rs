//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    CliArgs, Command, DatabaseArgs, DatabaseOverride, DeadTasksArgs, DeadTasksCommand,
    InvalidateArgs, SessionArgs, SessionCommand, WorkerArgs, WorkerOverrides,
};

use std::{collections::BTreeMap, num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::queue::{MAX_RETRY, MAX_TASK_TIMEOUT, QUEUE_CRITICAL, QUEUE_DEFAULT};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "scriptorium";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 60;
const DEFAULT_CACHE_MAX_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_CACHE_PURGE_INTERVAL_SECS: u64 = 60;
const DEFAULT_QUEUE_CRITICAL_WEIGHT: u32 = 10;
const DEFAULT_QUEUE_DEFAULT_WEIGHT: u32 = 5;
const DEFAULT_QUEUE_CONCURRENCY: u32 = 10;
const DEFAULT_QUEUE_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_QUEUE_ORPHAN_AFTER_SECS: u64 = 120;
const DEFAULT_QUEUE_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_QUEUE_RETRY_MAX_SECS: u64 = 5 * 60;
const DEFAULT_QUEUE_SHUTDOWN_TIMEOUT_SECS: u64 = 8;
const DEFAULT_QUEUE_ENQUEUE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_TASK_MAX_RETRY: u32 = 3;
const DEFAULT_TASK_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_IDEMPOTENCY_WINDOW_SECS: u64 = 12 * 60 * 60;
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub queue: QueueSettings,
    pub idempotency: IdempotencySettings,
    pub session: SessionSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

/// Where cache entries or queued tasks are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process-local; lost on restart.
    Memory,
    Postgres,
}

impl StorageBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Postgres => "postgres",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => Err(format!("unknown backend `{other}` (expected memory|postgres)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: StorageBackend,
    pub default_ttl_secs: NonZeroU32,
    pub max_ttl_secs: NonZeroU32,
    pub purge_interval_secs: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backend: StorageBackend,
    pub weights: Vec<(String, NonZeroU32)>,
    pub concurrency: NonZeroU32,
    pub poll_interval: Duration,
    /// Heartbeat silence after which a worker's tasks are redelivered.
    pub orphan_after: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub shutdown_timeout: Duration,
    pub enqueue_timeout: Duration,
    pub default_max_retry: u32,
    pub default_timeout: Duration,
    pub default_queue: String,
}

#[derive(Debug, Clone)]
pub struct IdempotencySettings {
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ttl: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("SCRIPTORIUM").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Worker(args)) => raw.apply_worker_overrides(&args.overrides),
        Some(Command::Migrate(args)) | Some(Command::Stats(args)) => {
            raw.apply_database_override(&args.database)
        }
        Some(Command::Invalidate(args)) => raw.apply_database_override(&args.database),
        Some(Command::DeadTasks(args)) => raw.apply_database_override(&args.database),
        Some(Command::Session(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_worker_overrides(&WorkerOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    queue: RawQueueSettings,
    idempotency: RawIdempotencySettings,
    session: RawSessionSettings,
}

impl RawSettings {
    fn apply_worker_overrides(&mut self, overrides: &WorkerOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(backend) = overrides.queue_backend.as_ref() {
            self.queue.backend = Some(backend.clone());
        }
        if let Some(concurrency) = overrides.queue_concurrency {
            self.queue.concurrency = Some(concurrency);
        }
        if let Some(seconds) = overrides.queue_shutdown_timeout_seconds {
            self.queue.shutdown_timeout_secs = Some(seconds);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    /// Compiled-in defaults with process-local cache and queue engines,
    /// ignoring files and environment. For tests and embedding only: nothing
    /// these engines hold is visible to another process.
    pub fn in_memory() -> Result<Self, LoadError> {
        let mut raw = RawSettings::default();
        raw.cache.backend = Some(StorageBackend::Memory.as_str().to_string());
        raw.queue.backend = Some(StorageBackend::Memory.as_str().to_string());
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
            queue,
            idempotency,
            session,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache)?;
        let queue = build_queue_settings(queue)?;
        let idempotency = build_idempotency_settings(idempotency)?;
        let session = build_session_settings(session)?;

        let needs_database = matches!(cache.backend, StorageBackend::Postgres)
            || matches!(queue.backend, StorageBackend::Postgres);
        if needs_database && database.url.is_none() {
            return Err(LoadError::invalid(
                "database.url",
                "required when a postgres backend is selected",
            ));
        }

        Ok(Self {
            logging,
            database,
            cache,
            queue,
            idempotency,
            session,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_backend(value: Option<String>, key: &'static str) -> Result<StorageBackend, LoadError> {
    match value {
        Some(value) => StorageBackend::from_str(&value).map_err(|reason| LoadError::invalid(key, reason)),
        None => Ok(StorageBackend::Postgres),
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = build_backend(cache.backend, "cache.backend")?;
    let default_ttl_secs = non_zero_u32(
        cache.default_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        "cache.default_ttl_secs",
    )?;
    let max_ttl_secs = non_zero_u32(
        cache.max_ttl_secs.unwrap_or(DEFAULT_CACHE_MAX_TTL_SECS),
        "cache.max_ttl_secs",
    )?;
    let purge_interval_secs = non_zero_u32(
        cache
            .purge_interval_secs
            .unwrap_or(DEFAULT_CACHE_PURGE_INTERVAL_SECS),
        "cache.purge_interval_secs",
    )?;

    if max_ttl_secs < default_ttl_secs {
        return Err(LoadError::invalid(
            "cache.max_ttl_secs",
            "must not be smaller than cache.default_ttl_secs",
        ));
    }

    Ok(CacheSettings {
        backend,
        default_ttl_secs,
        max_ttl_secs,
        purge_interval_secs,
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let backend = build_backend(queue.backend, "queue.backend")?;

    let raw_weights = queue.weights.unwrap_or_else(|| {
        BTreeMap::from([
            (QUEUE_CRITICAL.to_string(), DEFAULT_QUEUE_CRITICAL_WEIGHT),
            (QUEUE_DEFAULT.to_string(), DEFAULT_QUEUE_DEFAULT_WEIGHT),
        ])
    });
    if raw_weights.is_empty() {
        return Err(LoadError::invalid("queue.weights", "at least one queue is required"));
    }
    let weights = raw_weights
        .into_iter()
        .map(|(name, weight)| {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(LoadError::invalid("queue.weights", "queue names must not be empty"));
            }
            Ok((name, non_zero_u32(weight.into(), "queue.weights")?))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let concurrency = non_zero_u32(
        queue
            .concurrency
            .unwrap_or(DEFAULT_QUEUE_CONCURRENCY)
            .into(),
        "queue.concurrency",
    )?;

    let poll_interval = positive_duration(
        Duration::from_millis(queue.poll_interval_ms.unwrap_or(DEFAULT_QUEUE_POLL_INTERVAL_MS)),
        "queue.poll_interval_ms",
    )?;
    let orphan_after = positive_duration(
        Duration::from_secs(
            queue
                .orphan_after_secs
                .unwrap_or(DEFAULT_QUEUE_ORPHAN_AFTER_SECS),
        ),
        "queue.orphan_after_secs",
    )?;
    let retry_base_delay = positive_duration(
        Duration::from_millis(queue.retry_base_delay_ms.unwrap_or(DEFAULT_QUEUE_RETRY_BASE_MS)),
        "queue.retry_base_delay_ms",
    )?;
    let retry_max_delay = Duration::from_secs(
        queue
            .retry_max_delay_secs
            .unwrap_or(DEFAULT_QUEUE_RETRY_MAX_SECS),
    );
    if retry_max_delay < retry_base_delay {
        return Err(LoadError::invalid(
            "queue.retry_max_delay_secs",
            "must not be smaller than queue.retry_base_delay_ms",
        ));
    }
    let shutdown_timeout = Duration::from_secs(
        queue
            .shutdown_timeout_secs
            .unwrap_or(DEFAULT_QUEUE_SHUTDOWN_TIMEOUT_SECS),
    );
    let enqueue_timeout = positive_duration(
        Duration::from_millis(
            queue
                .enqueue_timeout_ms
                .unwrap_or(DEFAULT_QUEUE_ENQUEUE_TIMEOUT_MS),
        ),
        "queue.enqueue_timeout_ms",
    )?;

    let default_max_retry = queue.default_max_retry.unwrap_or(DEFAULT_TASK_MAX_RETRY);
    if default_max_retry > MAX_RETRY {
        return Err(LoadError::invalid(
            "queue.default_max_retry",
            format!("must not exceed {MAX_RETRY}"),
        ));
    }
    let default_timeout = positive_duration(
        Duration::from_millis(queue.default_timeout_ms.unwrap_or(DEFAULT_TASK_TIMEOUT_MS)),
        "queue.default_timeout_ms",
    )?;
    if default_timeout > MAX_TASK_TIMEOUT {
        return Err(LoadError::invalid(
            "queue.default_timeout_ms",
            format!("must not exceed {} ms", MAX_TASK_TIMEOUT.as_millis()),
        ));
    }

    let default_queue = queue
        .default_queue
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|| QUEUE_CRITICAL.to_string());
    if !weights.iter().any(|(name, _)| *name == default_queue) {
        return Err(LoadError::invalid(
            "queue.default_queue",
            format!("`{default_queue}` is not listed in queue.weights"),
        ));
    }

    Ok(QueueSettings {
        backend,
        weights,
        concurrency,
        poll_interval,
        orphan_after,
        retry_base_delay,
        retry_max_delay,
        shutdown_timeout,
        enqueue_timeout,
        default_max_retry,
        default_timeout,
        default_queue,
    })
}

fn build_idempotency_settings(
    idempotency: RawIdempotencySettings,
) -> Result<IdempotencySettings, LoadError> {
    let window = positive_duration(
        Duration::from_secs(
            idempotency
                .window_secs
                .unwrap_or(DEFAULT_IDEMPOTENCY_WINDOW_SECS),
        ),
        "idempotency.window_secs",
    )?;

    Ok(IdempotencySettings { window })
}

fn build_session_settings(session: RawSessionSettings) -> Result<SessionSettings, LoadError> {
    let ttl = positive_duration(
        Duration::from_secs(session.ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS)),
        "session.ttl_secs",
    )?;

    Ok(SessionSettings { ttl })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    default_ttl_secs: Option<u64>,
    max_ttl_secs: Option<u64>,
    purge_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    backend: Option<String>,
    weights: Option<BTreeMap<String, u32>>,
    concurrency: Option<u32>,
    poll_interval_ms: Option<u64>,
    orphan_after_secs: Option<u64>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_secs: Option<u64>,
    shutdown_timeout_secs: Option<u64>,
    enqueue_timeout_ms: Option<u64>,
    default_max_retry: Option<u32>,
    default_timeout_ms: Option<u64>,
    default_queue: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdempotencySettings {
    window_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSessionSettings {
    ttl_secs: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_duration(value: Duration, key: &'static str) -> Result<Duration, LoadError> {
    if value.is_zero() {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
