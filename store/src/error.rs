/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database is not open")]
    Closed,
    #[error("display name {0:?} is already linked to another account")]
    NameTaken(String),
    #[error("legacy import failed: {0}")]
    Import(String),
}
