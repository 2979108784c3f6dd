//! Full generation lifecycle against real OS signals and sockets.
//!
//! Kept in its own test binary: it delivers `SIGTERM` to this process.

mod common;

use std::sync::Arc;

use common::*;
use handoff::{HandoffConfig, HandoffServer, ListenAddr, Network, PidFile, TracingLogger};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_fresh_generation_serves_and_shuts_down_on_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("echo.pid");
    let config = HandoffConfig::new(Network::Tcp4, "127.0.0.1:0").with_pid_file(&pid_path);

    let mut server = HandoffServer::new(
        Arc::new(EchoService::default()),
        config,
        Some(Arc::new(TracingLogger)),
    )
    .await
    .unwrap();
    let addr = match server.local_addr() {
        Some(ListenAddr::Tcp(addr)) => addr,
        other => panic!("expected tcp listener, got {other:?}"),
    };

    let serving = tokio::spawn(async move {
        let result = server.serve().await;
        drop(server);
        result
    });

    wait_for_file(&pid_path).await;
    assert_eq!(PidFile::read(&pid_path), Some(std::process::id()));

    {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello\n").await.unwrap();
        let mut reply = String::new();
        BufReader::new(&mut stream).read_line(&mut reply).await.unwrap();
        assert_eq!(reply, "hello\n");
    }

    let rc = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
    assert_eq!(rc, 0);

    within(serving).await.unwrap().unwrap();

    // Every holder of the socket has let go.
    within(async {
        while TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await;
}
