use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data root {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to create data root {path:?}: {source}")]
    CreateDataRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to acquire lock on {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed json in {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("project {0:?} not found")]
    ProjectNotFound(String),

    #[error("project {0:?} already exists")]
    ProjectExists(String),

    #[error("task {0:?} not found")]
    TaskNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
