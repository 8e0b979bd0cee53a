use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while preparing or supervising a cloned session.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("hash check failed for {}: {reason}", path.display())]
    HashCheckFailed { path: PathBuf, reason: String },

    #[error("download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("unknown runtime stream '{0}'")]
    UnknownStream(String),

    #[error("runtime update failed: {0}")]
    RuntimeUpdateFailed(String),

    #[error("host runtime has not finished starting")]
    HostNotReady,

    #[error("failed to start {}: {reason}", program.display())]
    SpawnFailed { program: PathBuf, reason: String },

    #[error("child process error: {0}")]
    ChildProcessError(String),

    #[error("instance slot probe failed: {0}")]
    InstanceSlots(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CloneError {
    pub fn fetch(url: &str, reason: impl ToString) -> Self {
        Self::FetchFailed {
            url: url.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn download(url: &str, reason: impl ToString) -> Self {
        Self::DownloadFailed {
            url: url.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = CloneError> = std::result::Result<T, E>;
