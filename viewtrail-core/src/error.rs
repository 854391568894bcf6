use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("the fingerprint must be a non-empty string")]
    InvalidFingerprint,

    #[error("an explicit destination array is required")]
    MissingExplicitDest,

    #[error("{0:?} is not a valid page number")]
    InvalidPageNumber(Option<i64>),

    #[error("failed to read history config {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse history config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type HistoryResult<T> = std::result::Result<T, HistoryError>;
