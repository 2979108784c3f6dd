//! # handoff
//!
//! Zero-downtime restarts for long-running network services.
//!
//! ## Overview
//!
//! A [`HandoffServer`] wraps a [`ServiceHandle`] and its listening socket:
//! 1. On `SIGUSR2` the current generation spawns a successor, passing the
//!    listening descriptors via fd inheritance, and keeps serving
//! 2. The successor adopts the inherited socket, starts accepting, records its
//!    pid and only then sends `SIGTERM` to its parent
//! 3. The parent drains through the service's own graceful stop and exits
//!
//! At no point is the listening socket closed, so no connection is refused.
//!
//! ## Signal Conventions
//!
//! - `SIGINT` / `SIGTERM`: Graceful shutdown (drain, then return from `serve`)
//! - `SIGUSR2`: Spawn a successor generation and keep serving
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS`: Number of inherited file descriptors (starting at fd 3)
//! - `LISTEN_FD_NAMES`: Colon-separated socket family (`tcp`/`unix`) per fd
//! - `HANDOFF_PID_FILE`: Pid file path override
//! - `HANDOFF_DRAIN_TIMEOUT_SECS`: Optional bound on graceful stop, in seconds
//!
//! The listener variables are consumed by [`HandoffServer::new`]. The
//! `HANDOFF_*` overrides are only read through [`EnvOverrides::capture`] and
//! [`HandoffConfig::from_env`].
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other
//! platforms.

#[cfg(not(unix))]
compile_error!("handoff requires a Unix platform (Linux or macOS)");

mod config;
mod coordinator;
mod drain;
mod error;
mod factory;
mod listener;
mod logger;
mod parent;
mod pidfile;
mod service;
mod signals;
mod watcher;

pub use config::{
    EnvOverrides, FailurePolicy, Generation, HandoffConfig, Network, ParseNetworkError,
    ProcessContext,
};
pub use coordinator::HandoffServer;
pub use drain::{ConnectionGuard, ConnectionTracker};
pub use error::{BoxError, HandoffError, InheritError};
pub use factory::{InheritingListenerFactory, ListenerFactory};
pub use listener::{Connection, ListenAddr, Listener};
pub use logger::{Logger, StderrLogger, TracingLogger};
pub use parent::{ParentNotifier, SigtermParent};
pub use pidfile::{PidFile, PidFileError};
pub use service::ServiceHandle;
pub use signals::{OsSignals, SignalEvent, SignalSource};
pub use watcher::WatcherState;
