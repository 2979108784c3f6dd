//! Signal events driving the restart/terminate state machine.
//!
//! - `SIGINT` / `SIGTERM` → [`SignalEvent::Terminate`]
//! - `SIGUSR2` → [`SignalEvent::Restart`]
//!
//! The watcher consumes a [`SignalSource`], so tests drive it with a channel
//! instead of real signals.

use std::io;

use async_trait::async_trait;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// Drain and exit.
    Terminate,
    /// Spawn a successor and keep serving.
    Restart,
}

/// A consumable sequence of signal events.
#[async_trait]
pub trait SignalSource: Send + 'static {
    /// Wait for the next event. `None` means no more events will arrive.
    async fn next_event(&mut self) -> Option<SignalEvent>;
}

/// Real process signals.
///
/// Handlers are installed on construction and stay installed for the life of
/// the process, so a repeated `SIGTERM` after this source is dropped is
/// ignored rather than killing the process mid-drain.
pub struct OsSignals {
    sigint: Signal,
    sigterm: Signal,
    sigusr2: Signal,
}

impl OsSignals {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigusr2: signal(SignalKind::user_defined2())?,
        })
    }
}

#[async_trait]
impl SignalSource for OsSignals {
    async fn next_event(&mut self) -> Option<SignalEvent> {
        tokio::select! {
            Some(()) = self.sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                Some(SignalEvent::Terminate)
            }
            Some(()) = self.sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                Some(SignalEvent::Terminate)
            }
            Some(()) = self.sigusr2.recv() => {
                info!("Received SIGUSR2, starting successor process");
                Some(SignalEvent::Restart)
            }
            else => None,
        }
    }
}

#[async_trait]
impl SignalSource for Box<dyn SignalSource> {
    async fn next_event(&mut self) -> Option<SignalEvent> {
        (**self).next_event().await
    }
}

#[async_trait]
impl SignalSource for mpsc::UnboundedReceiver<SignalEvent> {
    async fn next_event(&mut self) -> Option<SignalEvent> {
        self.recv().await
    }
}

#[async_trait]
impl SignalSource for mpsc::Receiver<SignalEvent> {
    async fn next_event(&mut self) -> Option<SignalEvent> {
        self.recv().await
    }
}
