use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Failures while wiring the process: database, schema, telemetry, settings.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("database {context} failed")]
    Database {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("schema migration failed")]
    Migration(#[from] MigrateError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    /// Adapter for `map_err` that tags a sqlx error with what was attempted.
    pub fn database(context: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Database { context, source }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
