#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to database: {0}")]
    ConnectionError(#[source] sqlx::Error),
    #[error("failed to run initial migration: {0}")]
    MigrationError(#[source] sqlx::migrate::MigrateError),
    #[error("failed to insert artifact `{resource_name}`: {source}")]
    InsertError {
        resource_name: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to read artifacts: {0}")]
    ReadError(#[source] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
