//! Connection tracking for cooperative drain.
//!
//! The coordinator never decides how a service drains; it only calls
//! [`ServiceHandle::graceful_stop`](crate::ServiceHandle::graceful_stop).
//! [`ConnectionTracker`] is the building block services use to implement it:
//! a stop token for the accept loop plus a count of live connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Held by a connection for as long as it is in flight.
///
/// The tracker considers drain complete once every guard has dropped.
pub struct ConnectionGuard {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Stop token plus in-flight connection count.
#[derive(Clone)]
pub struct ConnectionTracker {
    /// Cancelled when the accept loop should stop taking new connections.
    accepting_stopped: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    /// Notified when the last connection drains.
    idle: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            accepting_stopped: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Token that fires when the accept loop should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.accepting_stopped.clone()
    }

    /// Stop accepting new connections. Idempotent.
    pub fn stop(&self) {
        self.accepting_stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.accepting_stopped.is_cancelled()
    }

    /// Register a connection; it counts until the returned guard is dropped.
    pub fn guard(&self) -> ConnectionGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            in_flight: Arc::clone(&self.in_flight),
            idle: Arc::clone(&self.idle),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no connection is in flight.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a drop in between is not missed.
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting, then wait for in-flight connections.
    ///
    /// With a timeout, returns `false` if connections remained when it expired.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        self.stop();

        let active = self.active_connections();
        if active == 0 {
            debug!("Nothing in flight");
            return true;
        }

        info!(
            active_connections = active,
            timeout_secs = timeout.map(|t| t.as_secs()),
            "Draining active connections"
        );

        let Some(timeout) = timeout else {
            self.wait_idle().await;
            info!("Connections drained");
            return true;
        };

        tokio::select! {
            _ = self.wait_idle() => {
                info!("Connections drained");
                true
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    in_flight = self.active_connections(),
                    timeout_secs = timeout.as_secs(),
                    "Drain timeout expired"
                );
                false
            }
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_drain() {
        let tracker = ConnectionTracker::new();
        let stop_token = tracker.stop_token();

        let guard1 = tracker.guard();
        let guard2 = tracker.guard();
        assert_eq!(tracker.active_connections(), 2);

        let draining = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.drain(None).await }
        });

        tokio::task::yield_now().await;
        drop(guard1);
        assert_eq!(tracker.active_connections(), 1);
        drop(guard2);

        assert!(draining.await.unwrap());
        assert!(stop_token.is_cancelled());
        assert_eq!(tracker.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.guard();

        let drained = tracker.drain(Some(Duration::from_millis(100))).await;
        assert!(!drained);
        assert!(tracker.is_stopped());
        assert_eq!(tracker.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_connection_guard_counting() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_connections(), 0);

        let mut guards: Vec<_> = (0..10).map(|_| tracker.guard()).collect();
        assert_eq!(tracker.active_connections(), 10);

        guards.truncate(5);
        assert_eq!(tracker.active_connections(), 5);

        drop(guards);
        assert_eq!(tracker.active_connections(), 0);
        tracker.wait_idle().await;
    }

    #[tokio::test]
    async fn test_last_guard_wakes_waiter() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.guard();

        let waiting = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_idle().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(!tracker.is_stopped());
    }
}
