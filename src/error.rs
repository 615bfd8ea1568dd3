use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The watched file could not be read or is not valid UTF-8.
#[derive(Debug, Error)]
#[error("failed to read {}", path.display())]
pub struct ReadError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// The OS watcher refused to register the path.
#[derive(Debug, Error)]
#[error("failed to watch {}", path.display())]
pub struct WatchRegistrationError {
    pub path: PathBuf,
    #[source]
    pub source: notify::Error,
}

/// Fatal failures while bringing up a viewing session.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Watch(#[from] WatchRegistrationError),
}
