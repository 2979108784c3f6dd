//! The restart/handoff coordinator.
//!
//! `serve` runs three flows per generation: the service's accept loop, the
//! signal watcher, and the rendezvous in `serve` itself. Ordering:
//!
//! 1. signal handlers are installed before the pid file is written, so
//!    anything that reads the pid file can safely signal us
//! 2. the pid file is written before the accept loop starts
//! 3. the accept loop is running before the parent is told to exit, so the
//!    listening socket always has at least one generation accepting on it

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FailurePolicy, Generation, HandoffConfig};
use crate::error::HandoffError;
use crate::factory::{InheritingListenerFactory, ListenerFactory};
use crate::listener::{ListenAddr, Listener};
use crate::logger::{Logger, StderrLogger};
use crate::parent::{ParentNotifier, SigtermParent};
use crate::pidfile::PidFile;
use crate::service::ServiceHandle;
use crate::signals::{OsSignals, SignalSource};
use crate::watcher::{SignalWatcher, WatcherState};

/// Serves a [`ServiceHandle`] on a listener that survives restarts.
pub struct HandoffServer {
    service: Arc<dyn ServiceHandle>,
    factory: Arc<dyn ListenerFactory>,
    listener: Option<Listener>,
    config: HandoffConfig,
    pid_file: PidFile,
    logger: Arc<dyn Logger>,
    notifier: Arc<dyn ParentNotifier>,
    /// Replaces the OS signal handlers when set. Behind a mutex only so the
    /// server stays `Sync`; it is never contended.
    signals: Mutex<Option<Box<dyn SignalSource>>>,
    state: Arc<watch::Sender<WatcherState>>,
}

impl HandoffServer {
    /// Obtain a listener from the inheritance marker in the environment,
    /// adopting an inherited socket or binding fresh.
    ///
    /// `logger` defaults to [`StderrLogger`].
    pub async fn new(
        service: Arc<dyn ServiceHandle>,
        config: HandoffConfig,
        logger: Option<Arc<dyn Logger>>,
    ) -> Result<Self, HandoffError> {
        let factory =
            InheritingListenerFactory::from_env().map_err(|e| HandoffError::Construction {
                network: config.network.to_string(),
                address: config.address.clone(),
                source: e.into(),
            })?;

        Self::with_factory(service, config, Arc::new(factory), logger).await
    }

    /// Like [`new`](Self::new) with an explicit listener factory.
    pub async fn with_factory(
        service: Arc<dyn ServiceHandle>,
        config: HandoffConfig,
        factory: Arc<dyn ListenerFactory>,
        logger: Option<Arc<dyn Logger>>,
    ) -> Result<Self, HandoffError> {
        let listener = factory
            .listen(config.network, &config.address)
            .await
            .map_err(|source| HandoffError::Construction {
                network: config.network.to_string(),
                address: config.address.clone(),
                source,
            })?;

        let (state, _) = watch::channel(WatcherState::Listening);
        let state = Arc::new(state);

        Ok(Self {
            service,
            factory,
            listener: Some(listener),
            pid_file: PidFile::new(config.pid_file.clone()),
            config,
            logger: logger.unwrap_or_else(|| Arc::new(StderrLogger)),
            notifier: Arc::new(SigtermParent),
            signals: Mutex::new(None),
            state,
        })
    }

    /// Drive the state machine from `signals` instead of OS signals.
    pub fn with_signals<S: SignalSource>(mut self, signals: S) -> Self {
        *self.signals.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(signals));
        self
    }

    /// Replace how the parent generation is told to exit.
    pub fn with_parent_notifier(mut self, notifier: Arc<dyn ParentNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// Address of the owned listener, if it has not been handed out yet.
    pub fn local_addr(&self) -> Option<ListenAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Take the listener back. `serve` then fails with `NotConstructed`.
    pub fn take_listener(&mut self) -> Option<Listener> {
        self.listener.take()
    }

    /// Observe the signal watcher's state.
    pub fn watch_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Serve until a graceful shutdown completes or the service fails.
    ///
    /// Returns `Ok(())` after a terminate signal has been fully drained. A
    /// failed parent notification is returned while the accept loop keeps
    /// running in the background (see [`FailurePolicy`]).
    pub async fn serve(&mut self) -> Result<(), HandoffError> {
        let listener = self.listener.take().ok_or(HandoffError::NotConstructed)?;
        let addr = self.display_addr(&listener);

        // Nothing is served yet, so the listener stays with the caller.
        let signals = match self.prepare(&addr) {
            Ok(signals) => signals,
            Err(e) => {
                self.listener = Some(listener);
                return Err(e);
            }
        };

        let process = self.config.process;
        let generation = process.generation();

        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        let terminated = CancellationToken::new();

        self.spawn_accept_loop(listener, errors_tx.clone()).await;

        let watcher = SignalWatcher {
            service: Arc::clone(&self.service),
            factory: Arc::clone(&self.factory),
            errors: errors_tx,
            terminated: terminated.clone(),
            state: Arc::clone(&self.state),
            drain_timeout: self.config.drain_timeout,
            on_successor_start_failure: self.config.on_successor_start_failure,
        };
        tokio::spawn(watcher.run(signals));

        if let Generation::Handoff { parent } = generation {
            if let Err(source) = self.notifier.terminate(parent) {
                match self.config.on_parent_termination_failure {
                    FailurePolicy::Abort => {
                        error!(
                            parent_pid = parent,
                            error = %source,
                            "Failed to close parent process"
                        );
                        return Err(HandoffError::ParentTermination { pid: parent, source });
                    }
                    FailurePolicy::Continue => {
                        warn!(
                            parent_pid = parent,
                            error = %source,
                            "Failed to close parent process, continuing to serve"
                        );
                    }
                }
            }
        }

        // A fatal error already queued wins over a shutdown finishing at the
        // same time.
        tokio::select! {
            biased;
            Some(err) = errors_rx.recv() => {
                error!(pid = process.pid, error = %err, "Serving stopped with error");
                Err(err)
            }
            _ = terminated.cancelled() => {
                self.logger.log(format_args!("Exiting pid {}.", process.pid));
                Ok(())
            }
        }
    }

    /// Install signal handlers, announce the generation and record the pid.
    fn prepare(&mut self, addr: &str) -> Result<Box<dyn SignalSource>, HandoffError> {
        let injected = self
            .signals
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let signals: Box<dyn SignalSource> = match injected {
            Some(signals) => signals,
            None => Box::new(OsSignals::new().map_err(HandoffError::SignalSetup)?),
        };

        let process = self.config.process;
        match process.generation() {
            Generation::Fresh => self
                .logger
                .log(format_args!("Serving {} with pid {}", addr, process.pid)),
            Generation::InitActivated => self
                .logger
                .log(format_args!("Listening on init activated {}", addr)),
            Generation::Handoff { parent } => self.logger.log(format_args!(
                "Graceful handoff of {} with new pid {} replace old pid {}",
                addr, process.pid, parent
            )),
        }

        self.pid_file.store(process.pid)?;
        Ok(signals)
    }

    /// Start the service's accept loop and wait until the task is running.
    async fn spawn_accept_loop(
        &self,
        listener: Listener,
        errors: mpsc::UnboundedSender<HandoffError>,
    ) {
        let service = Arc::clone(&self.service);
        let (started_tx, started_rx) = oneshot::channel();

        tokio::spawn(async move {
            let _ = started_tx.send(());
            match service.serve(listener).await {
                Ok(()) => debug!("Service stopped serving"),
                Err(e) => {
                    error!(error = %e, "Service failed while serving");
                    let _ = errors.send(HandoffError::ServeFatal(e));
                }
            }
        });

        // Only fails if the task was dropped before its first poll.
        let _ = started_rx.await;
        info!(pid = self.config.process.pid, "Accept loop started");
    }

    fn display_addr(&self, listener: &Listener) -> String {
        listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| self.config.address.clone())
    }
}
