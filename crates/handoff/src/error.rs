//! Error types for the handoff coordinator.

use std::io;

use thiserror::Error;

use crate::pidfile::PidFileError;

/// Boxed error crossing the service capability boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`HandoffServer`](crate::HandoffServer).
///
/// Every startup-aborting condition has its own variant so embedding
/// applications can match on it.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The listener could not be obtained (bind failed, bad inherited set).
    #[error("failed to acquire listener for {network} {address}: {source}")]
    Construction {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// `serve` was called on a coordinator that no longer owns a listener.
    #[error("handoff server has no listener; construct it with HandoffServer::new")]
    NotConstructed,

    /// OS signal handlers could not be registered.
    #[error("failed to register signal handlers: {0}")]
    SignalSetup(#[source] io::Error),

    /// The pid file could not be written.
    #[error("failed to persist pid: {0}")]
    PidPersist(#[from] PidFileError),

    /// The parent generation could not be told to exit.
    #[error("failed to close parent pid {pid}: {source}")]
    ParentTermination {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// The successor generation could not be spawned.
    #[error("failed to start successor process: {0}")]
    SuccessorStart(#[source] io::Error),

    /// The wrapped service stopped accepting with an error.
    #[error("service failed while serving: {0}")]
    ServeFatal(#[source] BoxError),
}

/// Problems with the descriptor set announced by `LISTEN_FDS`.
///
/// A half-inherited state is a bug in the parent process; it is reported
/// instead of silently falling back to a fresh bind.
#[derive(Debug, Error)]
pub enum InheritError {
    #[error("LISTEN_FDS is not a descriptor count: {0:?}")]
    InvalidCount(String),

    #[error("LISTEN_FDS is set but LISTEN_FD_NAMES is missing")]
    MissingNames,

    #[error("LISTEN_FD_NAMES has {names} entries but LISTEN_FDS says {fds}")]
    NameCountMismatch { names: usize, fds: usize },

    #[error("inherited fd {fd} has unknown socket family {name:?}")]
    UnknownFamily { fd: i32, name: String },

    #[error("inherited fd {fd} ({name}) is not a valid socket")]
    NotASocket { fd: i32, name: String },

    #[error("failed to adopt inherited fd {fd}: {source}")]
    Adopt {
        fd: i32,
        #[source]
        source: io::Error,
    },
}

impl From<InheritError> for io::Error {
    fn from(err: InheritError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}
