//! Error types for apiprobe

use thiserror::Error;

/// Result type alias using the apiprobe Error
pub type Result<T> = std::result::Result<T, Error>;

/// Apiprobe error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("manifest load error: {0}")]
    ManifestLoad(String),

    #[error("datastore index out of bounds: {index} (response list has {len} entries)")]
    DataStoreIndex { index: i64, len: usize },

    #[error("datastore key not found: {0}")]
    DataStoreKey(String),

    #[error("datastore index '{index}' is not an integer (key '{key}')")]
    DataStoreIndexType { key: String, index: String },

    #[error("invalid path spec: {0}")]
    PathSpec(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("query '{0}' did not resolve")]
    QueryEmpty(String),

    #[error("request build error: {0}")]
    RequestBuild(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response parse error: {0}")]
    ResponseParse(String),

    #[error("pre_process command failed: {0}")]
    PreProcess(String),

    #[error("oauth token fetch failed for client '{client}': {reason}")]
    OAuthToken { client: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a template error message
    pub fn template(msg: impl Into<String>) -> Self {
        Error::Template(msg.into())
    }
}
