//! Line echo service.
//!
//! Every line a client sends comes back prefixed with the pid of the
//! generation that served it, which makes handoffs visible from the client
//! side.

use async_trait::async_trait;
use handoff::{BoxError, Connection, ConnectionTracker, ListenAddr, Listener, ServiceHandle};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

pub struct EchoService {
    pid: u32,
    tracker: ConnectionTracker,
}

impl EchoService {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_connections()
    }
}

#[async_trait]
impl ServiceHandle for EchoService {
    async fn serve(&self, listener: Listener) -> Result<(), BoxError> {
        let stop = self.tracker.stop_token();
        info!(pid = self.pid, "Echo service accepting connections");

        loop {
            let (conn, peer) = tokio::select! {
                _ = stop.cancelled() => {
                    debug!("Accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let guard = self.tracker.guard();
            let stop = stop.clone();
            let pid = self.pid;
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = handle_connection(conn, &peer, pid, stop).await {
                    warn!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }
    }

    async fn graceful_stop(&self) {
        info!(active_connections = self.active_connections(), "Stopping echo service");
        self.tracker.drain(None).await;
    }
}

/// Echo lines until the client hangs up or the service stops.
///
/// A stop never interrupts a line that has already been read.
async fn handle_connection(
    conn: Connection,
    peer: &ListenAddr,
    pid: u32,
    stop: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    debug!(peer = %peer, "Connection opened");
    let (reader, mut writer) = tokio::io::split(conn);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            biased;
            line = lines.next_line() => line?,
            _ = stop.cancelled() => break,
        };
        let Some(line) = line else { break };
        writer.write_all(format!("{pid}: {line}\n").as_bytes()).await?;
    }

    writer.shutdown().await?;
    debug!(peer = %peer, "Connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn serving() -> (Arc<EchoService>, std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Arc::new(EchoService::new(4242));
        let task = {
            let service = service.clone();
            tokio::spawn(async move {
                service.serve(Listener::Tcp(listener)).await.unwrap();
            })
        };
        (service, addr, task)
    }

    #[tokio::test]
    async fn test_echoes_lines_with_pid() {
        let (_service, addr, _task) = serving().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping\npong\n").await.unwrap();

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "4242: ping\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "4242: pong\n");
    }

    #[tokio::test]
    async fn test_graceful_stop_closes_idle_connections() {
        let (service, addr, task) = serving().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"4242: hello\n");
        assert_eq!(service.active_connections(), 1);

        tokio::time::timeout(Duration::from_secs(5), service.graceful_stop())
            .await
            .unwrap();
        assert_eq!(service.active_connections(), 0);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        // The server side shut the connection down.
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_graceful_stop_without_connections() {
        let (service, _addr, task) = serving().await;

        service.graceful_stop().await;

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
