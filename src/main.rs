use std::{process, sync::Arc};

use scriptorium::{
    application::error::AppError,
    config,
    infra::{db::PostgresRepositories, telemetry, worker},
    queue::{Distributor, PostgresQueueBackend, QueueBackend, QueueConfig},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?error.chain(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?error.chain(), "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Worker(Box::<config::WorkerArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Worker(_) => run_worker(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
        config::Command::Invalidate(args) => run_invalidate(settings, args).await,
        config::Command::DeadTasks(args) => run_dead_tasks(settings, args).await,
        config::Command::Stats(_) => run_stats(settings).await,
        config::Command::Session(args) => run_session(settings, args).await,
    }
}

async fn run_worker(settings: config::Settings) -> Result<(), AppError> {
    worker::require_shared_engines(&settings)?;
    let backends = worker::connect_backends(&settings).await?;

    let report = worker::run_worker(&backends, &settings, shutdown_signal()).await?;
    if report.abandoned > 0 {
        warn!(
            target = "scriptorium::worker",
            abandoned = report.abandoned,
            "in-flight tasks abandoned; they are redelivered once this worker's heartbeat lapses"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(
            target = "scriptorium::worker",
            error = %err,
            "failed to listen for shutdown signal"
        );
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    // Connecting applies pending migrations.
    let repositories = init_repositories(&settings).await?;
    repositories.health_check().await?;
    info!(target = "scriptorium::migrate", "migrations applied");
    Ok(())
}

async fn run_invalidate(
    settings: config::Settings,
    args: config::InvalidateArgs,
) -> Result<(), AppError> {
    let keys = args.keys();
    if keys.is_empty() {
        return Err(AppError::validation(
            "invalidate requires at least one of --article, --slug or --session",
        ));
    }

    let queue = durable_queue(&settings).await?;
    let distributor = Distributor::new(queue, QueueConfig::from(&settings.queue));
    let task_id = distributor.enqueue_invalidation(&keys).await?;

    info!(
        target = "scriptorium::invalidate",
        task_id = ?task_id,
        keys = keys.len(),
        "invalidation enqueued"
    );
    for key in &keys {
        println!("{key}");
    }
    Ok(())
}

async fn run_dead_tasks(
    settings: config::Settings,
    args: config::DeadTasksArgs,
) -> Result<(), AppError> {
    let queue = durable_queue(&settings).await?;

    match args.command {
        config::DeadTasksCommand::List { limit } => {
            let tasks = queue.list_dead(limit).await?;
            for task in &tasks {
                println!(
                    "{}\t{}\t{}\tattempts={}\t{}",
                    task.id,
                    task.queue,
                    task.task_type,
                    task.attempts,
                    task.last_error.as_deref().unwrap_or("-")
                );
            }
            info!(target = "scriptorium::dead_tasks", count = tasks.len(), "dead tasks listed");
        }
        config::DeadTasksCommand::Requeue { id, all } => {
            if id.is_none() && !all {
                return Err(AppError::validation("requeue requires --id or --all"));
            }
            let requeued = queue.requeue_dead(id.as_deref()).await?;
            info!(target = "scriptorium::dead_tasks", requeued, "dead tasks requeued");
            println!("{requeued}");
        }
    }
    Ok(())
}

async fn run_stats(settings: config::Settings) -> Result<(), AppError> {
    let queue = durable_queue(&settings).await?;
    for stats in queue.stats().await? {
        println!(
            "{}\tpending={}\tscheduled={}\trunning={}\tretrying={}\tdead={}\tdone={}",
            stats.queue,
            stats.pending,
            stats.scheduled,
            stats.running,
            stats.retrying,
            stats.dead,
            stats.done
        );
    }
    Ok(())
}

async fn run_session(
    settings: config::Settings,
    args: config::SessionArgs,
) -> Result<(), AppError> {
    worker::require_shared_engines(&settings)?;
    let backends = worker::connect_backends(&settings).await?;
    let sessions = backends.sessions(&settings);

    match args.command {
        config::SessionCommand::Block { subject } => {
            let blocked = sessions.block(&subject).await?;
            info!(
                target = "scriptorium::session",
                subject = %subject,
                blocked,
                "session block requested"
            );
            println!("{blocked}");
        }
    }
    Ok(())
}

/// Operator commands act on the shared queue, so they always go to Postgres.
async fn durable_queue(settings: &config::Settings) -> Result<Arc<dyn QueueBackend>, AppError> {
    let repositories = init_repositories(settings).await?;
    Ok(Arc::new(PostgresQueueBackend::new(repositories.pool().clone())))
}

async fn init_repositories(settings: &config::Settings) -> Result<PostgresRepositories, AppError> {
    Ok(PostgresRepositories::open(&settings.database).await?)
}
