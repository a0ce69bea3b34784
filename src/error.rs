use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("CONTENT_UNAVAILABLE: Could not read '{uri}': {reason}")]
    ContentUnavailable { uri: String, reason: String },

    #[error("PARSE_FAILED: {0}")]
    ParseFailed(String),

    #[error("NOT_A_DIRECTORY: '{0}' is not a directory.")]
    NotADirectory(String),

    #[error("SPAWN_FAILED: Failed to start test process '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("STREAM_UNAVAILABLE: Test process has no {0} pipe. Spawn it with piped stdio.")]
    StreamUnavailable(&'static str),

    #[error("INVALID_SETTING: {0}")]
    InvalidSetting(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WATCH_FAILED: {0}")]
    Watch(#[from] notify::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
