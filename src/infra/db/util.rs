use sqlx::error::ErrorKind;

use crate::application::repos::RepoError;

/// SQLSTATE raised when `statement_timeout` cancels a query.
const QUERY_CANCELED: &str = "57014";
/// SQLSTATE for malformed literals such as a bad uuid.
const INVALID_TEXT_REPRESENTATION: &str = "22P02";

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation => RepoError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            },
            ErrorKind::ForeignKeyViolation => RepoError::InvalidInput {
                message: db.message().to_string(),
            },
            ErrorKind::NotNullViolation | ErrorKind::CheckViolation => RepoError::Integrity {
                message: db.message().to_string(),
            },
            _ => match db.code().as_deref() {
                Some(QUERY_CANCELED) => RepoError::Timeout,
                Some(INVALID_TEXT_REPRESENTATION) => RepoError::InvalidInput {
                    message: db.message().to_string(),
                },
                _ => RepoError::from_persistence(db),
            },
        },
        other => RepoError::from_persistence(other),
    }
}
