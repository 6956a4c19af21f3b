use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] sonic_rs::Error),

    #[error("no work items available")]
    NoWorkItems,

    #[error("invalid block range `{spec}`: {reason}")]
    InvalidBlockRange { spec: String, reason: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("bound fetch failed: {0}")]
    BoundFetch(String),

    #[error("request log is closed")]
    LoggerClosed,

    #[error("request log writer panicked")]
    LoggerPanicked,

    #[error("report input missing: {0:?}")]
    MissingInput(PathBuf),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
