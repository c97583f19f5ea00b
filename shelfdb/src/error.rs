use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShelfError {
    /// The calling code broke an API contract (unregistered collection, dropped
    /// store, out-of-range manual view index, read transaction used for a write).
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Registration failed for '{name}': {reason}")]
    Registration { name: String, reason: String },

    #[error("Cannot open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Materialized view state disagrees with the stored records.
    #[error("Inconsistent view state: {0}")]
    Inconsistent(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, ShelfError>;

impl ShelfError {
    pub(crate) fn contract(message: impl Into<String>) -> Self {
        ShelfError::ContractViolation(message.into())
    }

    pub(crate) fn registration(name: &str, reason: impl Into<String>) -> Self {
        ShelfError::Registration {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
