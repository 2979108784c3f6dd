//! Test doubles for driving the handoff coordinator without real process
//! state.
//!
//! Every double can share one [`EventLog`] so tests can assert on the order
//! in which the coordinator touched them.

#![allow(dead_code)]

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use handoff::{
    BoxError, ConnectionTracker, ListenerFactory, Listener, Logger, Network, ParentNotifier,
    ProcessContext, ServiceHandle,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered record of calls across doubles.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

/// Poll `check` until it holds or [`DEFAULT_TIMEOUT`] expires.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(DEFAULT_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Await `fut` with [`DEFAULT_TIMEOUT`].
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(DEFAULT_TIMEOUT, fut)
        .await
        .expect("operation timed out")
}

pub async fn wait_for_file(path: &Path) {
    wait_until(|| path.exists()).await;
}

pub fn process(inherited: bool, parent_pid: u32) -> ProcessContext {
    ProcessContext {
        pid: std::process::id(),
        parent_pid,
        inherited,
    }
}

/// How [`FakeService::serve`] behaves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Accept and count connections until stopped.
    Accept,
    /// Fail immediately as if the listener had been closed under us.
    FailImmediately,
}

pub struct FakeService {
    log: EventLog,
    mode: ServeMode,
    stop: CancellationToken,
    stops: AtomicUsize,
    accepted: AtomicUsize,
    drain_delay: Duration,
}

impl FakeService {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            mode: ServeMode::Accept,
            stop: CancellationToken::new(),
            stops: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            drain_delay: Duration::ZERO,
        }
    }

    pub fn failing(log: EventLog) -> Self {
        Self {
            mode: ServeMode::FailImmediately,
            ..Self::new(log)
        }
    }

    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = delay;
        self
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceHandle for FakeService {
    async fn serve(&self, listener: Listener) -> Result<(), BoxError> {
        self.log.push("serve");

        if self.mode == ServeMode::FailImmediately {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "listener closed").into());
        }

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    accepted?;
                    self.accepted.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    async fn graceful_stop(&self) {
        self.log.push("graceful_stop");
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.drain_delay.is_zero() {
            tokio::time::sleep(self.drain_delay).await;
        }
        self.stop.cancel();
    }
}

/// Binds real loopback listeners; spawns nothing.
pub struct FakeFactory {
    log: EventLog,
    fail_listen: bool,
    fail_start: bool,
    listeners: AtomicUsize,
    starts: AtomicUsize,
}

impl FakeFactory {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_listen: false,
            fail_start: false,
            listeners: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn failing_listen(log: EventLog) -> Self {
        Self {
            fail_listen: true,
            ..Self::new(log)
        }
    }

    pub fn failing_start(log: EventLog) -> Self {
        Self {
            fail_start: true,
            ..Self::new(log)
        }
    }

    pub fn listeners(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListenerFactory for FakeFactory {
    async fn listen(&self, network: Network, address: &str) -> io::Result<Listener> {
        self.log.push(format!("listen:{network}"));
        if self.fail_listen {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        }
        let listener = TcpListener::bind(address).await?;
        self.listeners.fetch_add(1, Ordering::SeqCst);
        Ok(Listener::Tcp(listener))
    }

    fn start_process(&self) -> io::Result<u32> {
        self.log.push("start_process");
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "fork refused"));
        }
        Ok(4242)
    }
}

pub struct RecordingNotifier {
    log: EventLog,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new(log: EventLog) -> Self {
        Self { log, fail: false }
    }

    pub fn failing(log: EventLog) -> Self {
        Self { log, fail: true }
    }
}

impl ParentNotifier for RecordingNotifier {
    fn terminate(&self, parent_pid: u32) -> io::Result<()> {
        self.log.push(format!("terminate_parent:{parent_pid}"));
        if self.fail {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<String>>,
}

impl RecordingLogger {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, args: fmt::Arguments<'_>) {
        self.lines.lock().unwrap().push(args.to_string());
    }
}

/// Line echo service with cooperative drain, as a real embedding would write.
#[derive(Default)]
pub struct EchoService {
    tracker: ConnectionTracker,
}

#[async_trait]
impl ServiceHandle for EchoService {
    async fn serve(&self, listener: Listener) -> Result<(), BoxError> {
        let stop = self.tracker.stop_token();
        loop {
            let (conn, _) = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };

            let guard = self.tracker.guard();
            tokio::spawn(async move {
                let _guard = guard;
                let (reader, mut writer) = tokio::io::split(conn);
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    async fn graceful_stop(&self) {
        self.tracker.drain(None).await;
    }
}
