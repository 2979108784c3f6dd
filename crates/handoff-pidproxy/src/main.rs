//! Proxy a restartable service for supervisors that expect a single
//! foreground process.
//!
//! The proxy spawns the service, then forwards every control signal it
//! receives to whichever pid the service's pid file currently names. After a
//! handoff the pid file points at the successor, so the supervisor keeps
//! controlling the live generation. The proxy exits once it has forwarded a
//! terminating signal, or once the pid file disappears or names a process that
//! no longer exists.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use handoff::PidFile;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the pid file is checked for a live process.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Signals relayed to the service, with the raw number passed to `kill`.
const FORWARDED: &[(&str, libc::c_int)] = &[
    ("SIGTERM", libc::SIGTERM),
    ("SIGHUP", libc::SIGHUP),
    ("SIGINT", libc::SIGINT),
    ("SIGUSR1", libc::SIGUSR1),
    ("SIGUSR2", libc::SIGUSR2),
    ("SIGQUIT", libc::SIGQUIT),
];

#[derive(Parser)]
#[command(name = "handoff-pidproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pid file the service keeps up to date
    pidfile: PathBuf,

    /// Command (and arguments) that starts the service
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

/// Why the proxy stopped.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Forwarded(&'static str),
    PidFileGone,
    ProcessGone(u32),
}

/// Whether the proxy should exit after forwarding `signo`.
fn is_terminal(signo: libc::c_int) -> bool {
    matches!(signo, libc::SIGTERM | libc::SIGINT | libc::SIGQUIT)
}

/// The pid recorded in `pidfile`, or `fallback` while none is readable.
fn target_pid(pidfile: &Path, fallback: u32) -> u32 {
    PidFile::read(pidfile).unwrap_or(fallback)
}

/// Whether a process with `pid` exists (zombies included).
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn send_signal(pid: u32, signo: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range"))
    })?;
    // SAFETY: plain kill(2) on a validated pid.
    if unsafe { libc::kill(pid, signo) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Install a handler per forwarded signal, funnelled into one channel.
fn forward_signals() -> io::Result<mpsc::UnboundedReceiver<(&'static str, libc::c_int)>> {
    let (tx, rx) = mpsc::unbounded_channel();
    for &(name, signo) in FORWARDED {
        let mut stream = signal(SignalKind::from_raw(signo))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send((name, signo)).is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}

async fn run(cli: Cli) -> Result<Exit> {
    // Handlers go in before the child exists so no signal is lost.
    let mut signals = forward_signals().context("Failed to install signal handlers")?;

    let Some((program, args)) = cli.command.split_first() else {
        anyhow::bail!("no command given");
    };
    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("Failed to start {}", Path::new(program).display()))?;
    let child_pid = child.id().context("Child exited before its pid was known")?;
    info!(pid = child_pid, pidfile = %cli.pidfile.display(), "Started service");

    let mut reaped = false;
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    // The first tick completes immediately.
    poll.tick().await;

    loop {
        tokio::select! {
            Some((name, signo)) = signals.recv() => {
                let pid = target_pid(&cli.pidfile, child_pid);
                match send_signal(pid, signo) {
                    Ok(()) => info!(signal = name, pid, "Forwarded signal"),
                    Err(e) => warn!(signal = name, pid, error = %e, "Failed to forward signal"),
                }
                if is_terminal(signo) {
                    return Ok(Exit::Forwarded(name));
                }
            }
            status = child.wait(), if !reaped => {
                reaped = true;
                log_child_exit(child_pid, status);
            }
            _ = poll.tick() => {
                let Some(pid) = PidFile::read(&cli.pidfile) else {
                    return Ok(Exit::PidFileGone);
                };
                if !process_alive(pid) {
                    return Ok(Exit::ProcessGone(pid));
                }
                debug!(pid, "Service still running");
            }
        }
    }
}

fn log_child_exit(pid: u32, status: io::Result<ExitStatus>) {
    match status {
        Ok(status) => info!(pid, %status, "Original process exited"),
        Err(e) => warn!(pid, error = %e, "Failed to wait for original process"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await? {
        Exit::Forwarded(name) => info!(signal = name, "Exiting after forwarding"),
        Exit::PidFileGone => info!("Pid file removed, exiting"),
        Exit::ProcessGone(pid) => info!(pid, "Service process gone, exiting"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_signals() {
        assert!(is_terminal(libc::SIGTERM));
        assert!(is_terminal(libc::SIGINT));
        assert!(is_terminal(libc::SIGQUIT));
        assert!(!is_terminal(libc::SIGHUP));
        assert!(!is_terminal(libc::SIGUSR2));
    }

    #[test]
    fn test_target_prefers_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.pid");

        assert_eq!(target_pid(&path, 17), 17);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(target_pid(&path, 17), 4242);

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(target_pid(&path, 17), 17);
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(i32::MAX as u32));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn test_cli_keeps_command_flags() {
        let cli =
            Cli::try_parse_from(["handoff-pidproxy", "/run/svc.pid", "svc", "--port", "80"])
                .unwrap();
        assert_eq!(cli.pidfile, PathBuf::from("/run/svc.pid"));
        assert_eq!(cli.command, vec!["svc", "--port", "80"]);
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["handoff-pidproxy", "/run/svc.pid"]).is_err());
    }
}
