use std::{io, path::PathBuf};

use thiserror::Error;

use crate::sink::Destination;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("could not create log file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing to the {destination} log failed: {source}")]
    Write {
        destination: Destination,
        #[source]
        source: io::Error,
    },
    #[error("the {0} log is already closed")]
    Closed(Destination),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TraceError>;
