//! The wrapped application.

use async_trait::async_trait;

use crate::error::BoxError;
use crate::listener::Listener;

/// A service that can serve a listener and drain on request.
#[async_trait]
pub trait ServiceHandle: Send + Sync + 'static {
    /// Accept and handle connections until stopped.
    ///
    /// Returns `Ok(())` once [`graceful_stop`](Self::graceful_stop) has closed
    /// the listener; any error is treated as fatal by the coordinator.
    async fn serve(&self, listener: Listener) -> Result<(), BoxError>;

    /// Stop accepting and wait for in-flight work to finish.
    ///
    /// The coordinator applies no timeout of its own unless configured with
    /// one, so this must eventually return.
    async fn graceful_stop(&self);
}
