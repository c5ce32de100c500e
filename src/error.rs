use thiserror::Error;

/// Crate-wide result type.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    // =========
    // Construction / startup
    // =========
    #[error("dialect '{0}' not supported (expected one of: mysql, postgres, pg, pgx)")]
    UnsupportedDialect(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("error creating schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("couldn't reach database: {0}")]
    Unreachable(#[source] sqlx::Error),

    // =========
    // Database
    // =========
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}
