/// Error type for `SQLite` store setup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection, schema or query failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<Error> for logbook_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Database(source) => Self::unavailable("accessing sqlite store", source),
        }
    }
}
