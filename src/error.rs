use std::path::PathBuf;
use thiserror::Error;

/// Failures that end a worker.
///
/// These travel inside `anyhow::Error`; supervisors recover the variant with
/// `err.downcast_ref::<TailError>()`.
#[derive(Error, Debug)]
pub enum TailError {
    #[error("log directory '{}' does not exist", .0.display())]
    WatchDirMissing(PathBuf),

    #[error("log directory '{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to open log file {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read log file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("directory watch failed: {0}")]
    Watch(#[from] notify::Error),
}
