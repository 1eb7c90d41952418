//! End-to-end reverse tunnel scenarios
//!
//! The manager under test runs the local service; its peer binds the public
//! port and relays every accepted client back across the control channel.

use std::io::ErrorKind;
use std::time::Duration;

use portmux_tunnel::{ChannelTransport, TunnelManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn manager_pair() -> (TunnelManager, TunnelManager) {
    let (near, far) = ChannelTransport::pair();
    (TunnelManager::new(near), TunnelManager::new(far))
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind(("::", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Echo server on the IPv6 loopback; returns its port
async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind(("::1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn expect_read(socket: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), socket.read_exact(&mut buf))
        .await
        .expect("timed out waiting for tunneled bytes")
        .expect("tunneled socket closed early");
    assert_eq!(buf, expected);
}

/// The remote listener goes away on `closeProxy`, which travels the control
/// channel; poll until the connect is refused.
async fn expect_refused(port: u16) {
    for _ in 0..100 {
        match TcpStream::connect(("::1", port)).await {
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => return,
            Ok(_) | Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("port {} still accepting connections", port);
}

#[tokio::test(flavor = "multi_thread")]
async fn reverse_tunnel_exposes_local_echo_on_the_peer() {
    init_tracing();

    let (local, _remote) = manager_pair();
    let echo_port = spawn_echo_server().await;
    let remote_port = free_port().await;

    let tunnel = timeout(
        Duration::from_secs(5),
        local.create_reverse_tunnel(echo_port, remote_port),
    )
    .await
    .expect("create_reverse_tunnel timed out")
    .expect("create_reverse_tunnel failed");

    // clients hit the REMOTE port; traffic lands on the local echo
    let mut socket = TcpStream::connect(("::1", remote_port)).await.unwrap();
    socket.write_all(b"over the wall").await.unwrap();
    expect_read(&mut socket, b"over the wall").await;

    tunnel.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_reverse_requests_share_one_tunnel() {
    init_tracing();

    let (local, _remote) = manager_pair();
    let echo_port = spawn_echo_server().await;
    let remote_port = free_port().await;

    let first = local
        .create_reverse_tunnel(echo_port, remote_port)
        .await
        .unwrap();
    let second = local
        .create_reverse_tunnel(echo_port, remote_port)
        .await
        .unwrap();
    assert_eq!(first, second);

    first.close().await;

    // still reachable while the second handle is open
    let mut socket = TcpStream::connect(("::1", remote_port)).await.unwrap();
    socket.write_all(b"still up").await.unwrap();
    expect_read(&mut socket, b"still up").await;
    drop(socket);

    second.close().await;
    expect_refused(remote_port).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reverse_tunnel_remote_bind_conflict_surfaces_peer_error() {
    init_tracing();

    let (local, _remote) = manager_pair();
    let blocker = TcpListener::bind(("::", 0)).await.unwrap();
    let port = blocker.local_addr().unwrap().port();

    let err = local
        .create_reverse_tunnel(12345, port)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("EADDRINUSE"));
    assert!(err.to_string().contains("EADDRINUSE"));

    // the failed request left nothing behind
    assert!(local.active_tunnels().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn reverse_tunnel_closes_clients_when_target_is_down() {
    init_tracing();

    let (local, _remote) = manager_pair();
    // nothing listens on this port, so every relayed dial fails
    let target_port = free_port().await;
    let remote_port = free_port().await;

    let tunnel = local
        .create_reverse_tunnel(target_port, remote_port)
        .await
        .unwrap();

    let mut socket = TcpStream::connect(("::1", remote_port)).await.unwrap();
    let mut buf = [0u8; 16];
    match timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("timed out waiting for the relayed close")
    {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} bytes from a dead target", n),
        Err(_) => {} // a reset also counts as closed
    }

    tunnel.close().await;
}
