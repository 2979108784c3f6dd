//! Pid file persistence.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PidFileError {
    /// No pid file path was configured.
    #[error("no pid file path configured")]
    NoPath,

    #[error("could not write pid file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Records the pid of the generation currently serving.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: Option<PathBuf>,
}

impl PidFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Truncate-create the pid file and write `pid` as decimal text.
    pub fn store(&self, pid: u32) -> Result<(), PidFileError> {
        let path = self.path.as_ref().ok_or(PidFileError::NoPath)?;

        let io_err = |source| PidFileError::Io {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o666)
            .open(path)
            .map_err(io_err)?;
        file.write_all(pid.to_string().as_bytes()).map_err(io_err)?;

        debug!(pid, path = %path.display(), "Stored pid file");
        Ok(())
    }

    /// Read a pid back. Missing or unparsable files read as `None`.
    pub fn read(path: impl AsRef<Path>) -> Option<u32> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|contents| contents.trim().parse().ok())
    }
}
