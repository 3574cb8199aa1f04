use rusqlite::ErrorCode;
use rusqlite::ffi;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint was hit by a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Busy/locked database or poisoned connection lock. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The write was rejected before touching any row.
    #[error("invalid: {0}")]
    Invalid(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    return StoreError::Unavailable(err.to_string());
                }
                ErrorCode::ConstraintViolation
                    if failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                        || failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    return StoreError::Conflict(err.to_string());
                }
                _ => {}
            }
        }
        StoreError::Sqlite(err)
    }
}
