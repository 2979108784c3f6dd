//! Restart/terminate state machine.
//!
//! ```text
//!   Listening ──Terminate──▶ Terminating ──drained──▶ Done
//!      │  ▲
//!      └──┘ Restart (spawn successor)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FailurePolicy;
use crate::error::HandoffError;
use crate::factory::ListenerFactory;
use crate::service::ServiceHandle;
use crate::signals::{SignalEvent, SignalSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Serving and consuming signals.
    Listening,
    /// Signal consumption stopped; the service is draining.
    Terminating,
    /// Drain finished and the termination marker is closed.
    Done,
}

pub(crate) struct SignalWatcher {
    pub(crate) service: Arc<dyn ServiceHandle>,
    pub(crate) factory: Arc<dyn ListenerFactory>,
    /// Shared with the accept loop; the first error received ends `serve`.
    pub(crate) errors: mpsc::UnboundedSender<HandoffError>,
    /// Cancelled exactly once, when graceful shutdown finishes.
    pub(crate) terminated: CancellationToken,
    pub(crate) state: Arc<watch::Sender<WatcherState>>,
    pub(crate) drain_timeout: Option<Duration>,
    pub(crate) on_successor_start_failure: FailurePolicy,
}

impl SignalWatcher {
    /// Consume events until a terminate event has been fully handled or the
    /// source ends.
    pub(crate) async fn run<S: SignalSource>(self, mut source: S) {
        while let Some(event) = source.next_event().await {
            match event {
                SignalEvent::Restart => self.restart(),
                SignalEvent::Terminate => {
                    // Stop consuming before draining: at most one shutdown runs.
                    drop(source);
                    self.terminate().await;
                    return;
                }
            }
        }
        debug!("Signal source closed, watcher stopping");
    }

    fn restart(&self) {
        match self.factory.start_process() {
            Ok(pid) => info!(successor_pid = pid, "Successor process started, waiting for handoff"),
            Err(e) => match self.on_successor_start_failure {
                FailurePolicy::Abort => {
                    error!(error = %e, "Failed to start successor process");
                    // serve() may already have returned; nothing else to tell.
                    let _ = self.errors.send(HandoffError::SuccessorStart(e));
                }
                FailurePolicy::Continue => {
                    warn!(error = %e, "Failed to start successor process, continuing to serve");
                }
            },
        }
    }

    async fn terminate(self) {
        self.state.send_replace(WatcherState::Terminating);
        info!("Draining service");

        match self.drain_timeout {
            None => self.service.graceful_stop().await,
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.service.graceful_stop())
                    .await
                    .is_err()
                {
                    warn!(
                        timeout_secs = timeout.as_secs(),
                        "Graceful stop timed out, exiting anyway"
                    );
                }
            }
        }

        self.state.send_replace(WatcherState::Done);
        self.terminated.cancel();
    }
}
