use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "scriptorium_cache_hit_total",
            Unit::Count,
            "Cache reads that returned a decodable value."
        );
        describe_counter!(
            "scriptorium_cache_miss_total",
            Unit::Count,
            "Cache reads that found no live entry."
        );
        describe_counter!(
            "scriptorium_cache_purged_total",
            Unit::Count,
            "Expired cache entries removed by the sweeper."
        );
        describe_counter!(
            "scriptorium_idempotency_duplicate_total",
            Unit::Count,
            "Guarded actions suppressed as duplicates within their window."
        );
        describe_counter!(
            "scriptorium_queue_enqueued_total",
            Unit::Count,
            "Tasks durably enqueued."
        );
        describe_counter!(
            "scriptorium_queue_enqueue_failed_total",
            Unit::Count,
            "Enqueue attempts that failed, timed out or were cancelled."
        );
        describe_counter!(
            "scriptorium_queue_processed_total",
            Unit::Count,
            "Task attempts that completed successfully."
        );
        describe_counter!(
            "scriptorium_queue_retried_total",
            Unit::Count,
            "Failed task attempts scheduled for retry."
        );
        describe_counter!(
            "scriptorium_queue_dead_total",
            Unit::Count,
            "Tasks moved to the dead set after exhausting retries."
        );
        describe_counter!(
            "scriptorium_queue_purged_total",
            Unit::Count,
            "Completed tasks forgotten by the maintenance loop."
        );
        describe_histogram!(
            "scriptorium_queue_attempt_seconds",
            Unit::Seconds,
            "Wall time of a single task attempt."
        );
        describe_gauge!(
            "scriptorium_queue_depth",
            Unit::Count,
            "Tasks per queue and state, sampled by the worker."
        );
        describe_counter!(
            "scriptorium_tx_rolled_back_total",
            Unit::Count,
            "Transactions rolled back because the caller's work failed."
        );
        describe_counter!(
            "scriptorium_tx_commit_failed_total",
            Unit::Count,
            "Transactions whose commit failed."
        );
        describe_counter!(
            "scriptorium_effect_dispatched_total",
            Unit::Count,
            "Post-commit effects handed to the queue."
        );
        describe_counter!(
            "scriptorium_effect_dispatch_failed_total",
            Unit::Count,
            "Post-commit effects that could not be dispatched."
        );
    });
}
