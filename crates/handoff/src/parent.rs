//! Telling the previous generation to exit.

use std::io;

use tracing::info;

/// Asks a parent generation to terminate once this one is serving.
pub trait ParentNotifier: Send + Sync + 'static {
    fn terminate(&self, parent_pid: u32) -> io::Result<()>;
}

/// Sends `SIGTERM`, which the parent treats as a graceful shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigtermParent;

impl ParentNotifier for SigtermParent {
    fn terminate(&self, parent_pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(parent_pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "parent pid out of range"))?;

        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            return Err(io::Error::last_os_error());
        }

        info!(parent_pid, "Sent SIGTERM to parent process");
        Ok(())
    }
}
