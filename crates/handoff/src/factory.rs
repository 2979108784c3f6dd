//! Listener acquisition and successor spawning.
//!
//! [`InheritingListenerFactory`] checks `LISTEN_FDS` and `LISTEN_FD_NAMES`
//! (compatible with systemd socket activation) and adopts inherited sockets
//! before binding anything fresh. Every listener it hands out is retained as
//! a close-on-exec duplicate so it can be passed to a successor process.

use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info};

use crate::config::{Network, LISTEN_FDS, LISTEN_FD_NAMES};
use crate::error::InheritError;
use crate::listener::Listener;

/// First inherited descriptor, as in systemd socket activation.
const LISTEN_FDS_START: RawFd = 3;

/// Temporary descriptors are parked at or above this value while spawning so
/// they cannot collide with the 3..3+N target range.
const HIGH_FD_BASE: RawFd = 100;

/// Obtains listeners and starts successor generations.
#[async_trait]
pub trait ListenerFactory: Send + Sync + 'static {
    /// Adopt an inherited listener for `address`, or bind a fresh one.
    async fn listen(&self, network: Network, address: &str) -> io::Result<Listener>;

    /// Spawn a successor process that inherits every listener handed out so
    /// far. Returns the successor's pid.
    fn start_process(&self) -> io::Result<u32>;
}

/// A descriptor adopted from the parent, not yet claimed by `listen`.
#[derive(Debug)]
enum Inherited {
    Tcp(StdTcpListener),
    Unix(StdUnixListener),
}

impl Inherited {
    fn matches(&self, network: Network, address: &str, resolved: &[SocketAddr]) -> bool {
        match (self, network) {
            (Inherited::Unix(listener), Network::Unix) => listener
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p == Path::new(address)))
                .unwrap_or(false),
            (Inherited::Tcp(listener), Network::Tcp | Network::Tcp4 | Network::Tcp6) => {
                let Ok(local) = listener.local_addr() else {
                    return false;
                };
                // A requested port of 0 cannot be known by the successor, so
                // it matches whatever port the predecessor was given.
                resolved.iter().any(|want| {
                    want.ip() == local.ip() && (want.port() == 0 || want.port() == local.port())
                })
            }
            _ => false,
        }
    }

    fn into_listener(self) -> io::Result<Listener> {
        match self {
            Inherited::Tcp(listener) => Ok(Listener::Tcp(TcpListener::from_std(listener)?)),
            Inherited::Unix(listener) => Ok(Listener::Unix(UnixListener::from_std(listener)?)),
        }
    }
}

/// The production [`ListenerFactory`].
#[derive(Debug)]
pub struct InheritingListenerFactory {
    inherited: Mutex<Vec<Inherited>>,
    /// Close-on-exec duplicates of every listener handed out, with family name.
    active: Mutex<Vec<(&'static str, OwnedFd)>>,
    /// Program and arguments for successors; `None` re-executes this binary.
    command: Option<(PathBuf, Vec<OsString>)>,
}

impl InheritingListenerFactory {
    /// Create a factory from the inheritance marker in the environment.
    ///
    /// Returns an empty factory if `LISTEN_FDS` is absent or "0" (cold start).
    /// The environment is left untouched; successors get explicit values.
    pub fn from_env() -> Result<Self, InheritError> {
        let fds = std::env::var(LISTEN_FDS).ok();
        let names = std::env::var(LISTEN_FD_NAMES).ok();
        let inherited = inherit_from(LISTEN_FDS_START, fds.as_deref(), names.as_deref())?;

        if !inherited.is_empty() {
            info!(count = inherited.len(), "Inherited listeners from parent process");
        }

        Ok(Self::with_inherited(inherited))
    }

    /// A factory that always binds fresh.
    pub fn new() -> Self {
        Self::with_inherited(Vec::new())
    }

    fn with_inherited(inherited: Vec<Inherited>) -> Self {
        Self {
            inherited: Mutex::new(inherited),
            active: Mutex::new(Vec::new()),
            command: None,
        }
    }

    /// Spawn successors with `program args...` instead of re-executing the
    /// current binary.
    pub fn with_command(mut self, program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        self.command = Some((program.into(), args));
        self
    }

    /// Number of inherited listeners not yet claimed by `listen`.
    pub fn unclaimed(&self) -> usize {
        self.inherited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of listeners that would be passed to a successor.
    pub fn active(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn take_inherited(
        &self,
        network: Network,
        address: &str,
        resolved: &[SocketAddr],
    ) -> Option<Inherited> {
        let mut inherited = self.inherited.lock().unwrap_or_else(PoisonError::into_inner);
        let pos = inherited
            .iter()
            .position(|candidate| candidate.matches(network, address, resolved))?;
        Some(inherited.remove(pos))
    }

    fn successor_command(&self) -> io::Result<(PathBuf, Vec<OsString>)> {
        match &self.command {
            Some(command) => Ok(command.clone()),
            None => Ok((
                std::env::current_exe()?,
                std::env::args_os().skip(1).collect(),
            )),
        }
    }
}

impl Default for InheritingListenerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListenerFactory for InheritingListenerFactory {
    async fn listen(&self, network: Network, address: &str) -> io::Result<Listener> {
        let resolved = match network {
            Network::Unix => Vec::new(),
            _ => resolve(network, address).await?,
        };

        let listener = match self.take_inherited(network, address, &resolved) {
            Some(inherited) => {
                let listener = inherited.into_listener()?;
                info!(
                    %network,
                    address,
                    local = ?listener.local_addr().ok(),
                    "Adopted inherited listener"
                );
                listener
            }
            None => {
                let listener = bind(network, address, &resolved).await?;
                info!(
                    %network,
                    address,
                    local = ?listener.local_addr().ok(),
                    "Bound fresh listener"
                );
                listener
            }
        };

        let retained = listener.as_fd().try_clone_to_owned()?;
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((listener.family(), retained));

        Ok(listener)
    }

    /// 1. Dups each retained fd to a temporary high fd (CLOEXEC)
    /// 2. Spawns the successor with LISTEN_FDS and LISTEN_FD_NAMES set
    /// 3. In the child, dup2s the temporaries onto 3..3+N, which clears CLOEXEC
    fn start_process(&self) -> io::Result<u32> {
        let (program, args) = self.successor_command()?;

        // Phase 1: park duplicates above the target range. If a source fd sat
        // at 4 and another had to land on 4, a direct dup2 would destroy it.
        let (names, temp_fds) = {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let mut temp_fds: Vec<OwnedFd> = Vec::with_capacity(active.len());
            for (_, fd) in active.iter() {
                let raw =
                    unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, HIGH_FD_BASE) };
                if raw < 0 {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: fcntl returned a fresh descriptor that nothing else owns.
                temp_fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
            let names: Vec<&str> = active.iter().map(|(family, _)| *family).collect();
            (names.join(":"), temp_fds)
        };

        let sources: Vec<RawFd> = temp_fds.iter().map(AsRawFd::as_raw_fd).collect();
        debug!(fds = ?sources, names = %names, program = %program.display(), "Preparing successor");

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env(LISTEN_FDS, sources.len().to_string())
            .env(LISTEN_FD_NAMES, &names);

        // Phase 2 runs in the forked child, so only async-signal-safe calls.
        unsafe {
            command.pre_exec(move || {
                for (i, &source) in sources.iter().enumerate() {
                    let target = LISTEN_FDS_START + i as RawFd;
                    if source == target {
                        let flags = libc::fcntl(target, libc::F_GETFD);
                        if flags < 0
                            || libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                        {
                            return Err(io::Error::last_os_error());
                        }
                    } else if libc::dup2(source, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = child.id();

        info!(
            pid,
            fds = temp_fds.len(),
            names = %names,
            program = %program.display(),
            "Started successor process"
        );

        // Closing the parent's temporaries leaves the originals untouched.
        drop(temp_fds);
        Ok(pid)
    }
}

/// Resolve `address` to the socket addresses allowed by `network`.
async fn resolve(network: Network, address: &str) -> io::Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await?
        .filter(|addr| match network {
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
            _ => true,
        })
        .collect();

    if resolved.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {network} address for {address}"),
        ));
    }
    Ok(resolved)
}

async fn bind(network: Network, address: &str, resolved: &[SocketAddr]) -> io::Result<Listener> {
    if network == Network::Unix {
        return Ok(Listener::Unix(UnixListener::bind(address)?));
    }

    let mut last_err = None;
    for addr in resolved {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(Listener::Tcp(listener)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address to bind for {address}"))
    }))
}

/// Adopt `count` descriptors starting at `start`, named by `names`.
fn inherit_from(
    start: RawFd,
    count: Option<&str>,
    names: Option<&str>,
) -> Result<Vec<Inherited>, InheritError> {
    let count: usize = match count.map(str::trim) {
        None | Some("") => return Ok(Vec::new()),
        Some(raw) => raw
            .parse()
            .map_err(|_| InheritError::InvalidCount(raw.to_string()))?,
    };
    if count == 0 {
        return Ok(Vec::new());
    }

    let names: Vec<&str> = names.ok_or(InheritError::MissingNames)?.split(':').collect();
    if names.len() != count {
        return Err(InheritError::NameCountMismatch {
            names: names.len(),
            fds: count,
        });
    }

    let mut inherited = Vec::with_capacity(count);
    for (i, name) in names.into_iter().enumerate() {
        let fd = start + i as RawFd;

        if name != "tcp" && name != "unix" {
            return Err(InheritError::UnknownFamily {
                fd,
                name: name.to_string(),
            });
        }
        if !validate_fd(fd) {
            return Err(InheritError::NotASocket {
                fd,
                name: name.to_string(),
            });
        }

        // SAFETY: We validated the fd is a valid socket via fstat, and the
        // parent handed it to us for exclusive use.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let adopt_err = |source| InheritError::Adopt { fd, source };
        set_cloexec(&owned).map_err(adopt_err)?;

        let listener = if name == "tcp" {
            let listener = StdTcpListener::from(owned);
            listener.set_nonblocking(true).map_err(adopt_err)?;
            Inherited::Tcp(listener)
        } else {
            let listener = StdUnixListener::from(owned);
            listener.set_nonblocking(true).map_err(adopt_err)?;
            Inherited::Unix(listener)
        };

        debug!(fd, name, "Adopted inherited fd");
        inherited.push(listener);
    }

    Ok(inherited)
}

/// Keep adopted descriptors from leaking into unrelated children.
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Validate that a file descriptor is a valid socket using fstat.
fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
