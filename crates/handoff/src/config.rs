//! Coordinator configuration.
//!
//! Process-global facts (our pid, the parent pid, whether descriptors were
//! inherited) are captured once into [`ProcessContext`] so the coordinator
//! never consults the environment on its own.
//!
//! # Environment Variables
//!
//! Read by [`EnvOverrides::capture`] and applied by [`HandoffConfig::from_env`]:
//!
//! - `HANDOFF_PID_FILE`: Pid file path (overrides the configured one)
//! - `HANDOFF_DRAIN_TIMEOUT_SECS`: Bound on graceful stop in whole seconds.
//!   Default: unbounded

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

/// Pid of the init process. A parent with this pid is never signalled.
pub const INIT_PID: u32 = 1;

pub(crate) const LISTEN_FDS: &str = "LISTEN_FDS";
pub(crate) const LISTEN_FD_NAMES: &str = "LISTEN_FD_NAMES";

/// Socket family a listener is bound in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// TCP over IPv4 or IPv6, whichever the address resolves to first.
    #[default]
    Tcp,
    /// TCP restricted to IPv4 addresses.
    Tcp4,
    /// TCP restricted to IPv6 addresses.
    Tcp6,
    /// Unix-domain stream socket bound at a filesystem path.
    Unix,
}

impl Network {
    /// Family name used in `LISTEN_FD_NAMES`.
    pub(crate) fn family(&self) -> &'static str {
        match self {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Tcp4 => write!(f, "tcp4"),
            Network::Tcp6 => write!(f, "tcp6"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown network {0:?}, expected tcp, tcp4, tcp6 or unix")]
pub struct ParseNetworkError(String);

impl FromStr for Network {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            _ => Err(ParseNetworkError(s.to_string())),
        }
    }
}

/// Identity of this process generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessContext {
    pub pid: u32,
    pub parent_pid: u32,
    /// Whether the inheritance marker (`LISTEN_FDS`) was present at startup.
    pub inherited: bool,
}

impl ProcessContext {
    /// Capture the current process identity and inheritance marker.
    pub fn capture() -> Self {
        let inherited = std::env::var(LISTEN_FDS)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .is_some_and(|n| n > 0);

        Self {
            pid: std::process::id(),
            parent_pid: std::os::unix::process::parent_id(),
            inherited,
        }
    }

    /// Classify this generation.
    pub fn generation(&self) -> Generation {
        match (self.inherited, self.parent_pid) {
            (false, _) => Generation::Fresh,
            (true, INIT_PID) => Generation::InitActivated,
            (true, parent) => Generation::Handoff { parent },
        }
    }
}

/// How this process came to own its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Bound the listener itself.
    Fresh,
    /// Inherited descriptors from init (socket activation); no parent to close.
    InitActivated,
    /// Inherited descriptors from a live predecessor that must be told to exit.
    Handoff { parent: u32 },
}

/// What to do when an auxiliary step of the handoff fails.
///
/// The defaults keep the historical asymmetry: a failed parent notification
/// is returned from `serve` while the accept loop keeps running, and a failed
/// successor spawn is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Surface the error from `serve`.
    #[default]
    Abort,
    /// Log the error and carry on.
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" | "fatal" => Ok(FailurePolicy::Abort),
            "continue" | "tolerate" => Ok(FailurePolicy::Continue),
            other => Err(format!(
                "unknown failure policy {other:?}, expected abort or continue"
            )),
        }
    }
}

/// Settings read from `HANDOFF_*` environment variables.
///
/// Empty values are treated as unset and an unparsable drain timeout is
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// `HANDOFF_PID_FILE`
    pub pid_file: Option<PathBuf>,
    /// `HANDOFF_DRAIN_TIMEOUT_SECS`
    pub drain_timeout: Option<Duration>,
}

impl EnvOverrides {
    pub fn capture() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            pid_file: value("HANDOFF_PID_FILE").map(PathBuf::from),
            drain_timeout: value("HANDOFF_DRAIN_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        }
    }
}

/// Everything a [`HandoffServer`](crate::HandoffServer) needs besides its
/// capabilities.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub network: Network,
    pub address: String,
    pub pid_file: Option<PathBuf>,
    pub process: ProcessContext,
    /// Upper bound on the service's graceful stop. `None` waits forever.
    pub drain_timeout: Option<Duration>,
    pub on_parent_termination_failure: FailurePolicy,
    pub on_successor_start_failure: FailurePolicy,
}

impl HandoffConfig {
    /// Create a configuration for `address`, capturing the current process.
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            pid_file: None,
            process: ProcessContext::capture(),
            drain_timeout: None,
            on_parent_termination_failure: FailurePolicy::default(),
            on_successor_start_failure: FailurePolicy::default(),
        }
    }

    /// Like [`new`](Self::new), then apply [`EnvOverrides::capture`].
    pub fn from_env(network: Network, address: impl Into<String>) -> Self {
        Self::new(network, address).with_env_overrides(&EnvOverrides::capture())
    }

    /// Replace the pid file and drain timeout with whichever `env` sets.
    pub fn with_env_overrides(mut self, env: &EnvOverrides) -> Self {
        if let Some(path) = &env.pid_file {
            self.pid_file = Some(path.clone());
        }
        if let Some(timeout) = env.drain_timeout {
            self.drain_timeout = Some(timeout);
        }
        self
    }

    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn with_process(mut self, process: ProcessContext) -> Self {
        self.process = process;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    pub fn with_parent_termination_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_parent_termination_failure = policy;
        self
    }

    pub fn with_successor_start_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_successor_start_failure = policy;
        self
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            network = %self.network,
            address = %self.address,
            pid_file = ?self.pid_file,
            generation = ?self.process.generation(),
            drain_timeout_secs = self.drain_timeout.map(|d| d.as_secs()),
            "Handoff configuration"
        );
    }
}
