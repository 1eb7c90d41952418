//! Byte pumps bridging one TCP socket to the control channel

use std::sync::Weak;

use bytes::Bytes;
use portmux_proto::{ConnectionId, TunnelId, TunnelMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::manager::ManagerInner;

/// Socket-side read buffer size
pub(crate) const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Event delivered to a connection task by the protocol engine
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// Payload to write to the socket
    Data(Bytes),
    /// Peer half-closed; shut our write side down once the queue drains
    End,
    /// Destroy the socket without further notice to the peer
    Close,
}

/// Bridge one TCP socket to `data`/`end`/`close` messages until both
/// directions are done, then unregister.
///
/// The accept side passes `announce` so `newConnection` goes out before the
/// first read; the event channel keeps inbound writes in arrival order.
pub(crate) async fn run_connection(
    manager: Weak<ManagerInner>,
    stream: TcpStream,
    mut events: mpsc::UnboundedReceiver<ConnEvent>,
    tunnel_id: TunnelId,
    connection_id: ConnectionId,
    announce: bool,
) {
    if announce {
        let announced = send_message(
            &manager,
            TunnelMessage::NewConnection {
                tunnel_id: tunnel_id.clone(),
                connection_id,
            },
        )
        .await;
        if !announced {
            unregister(&manager, &tunnel_id, connection_id).await;
            return;
        }
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut read_open = true;
    let mut write_open = true;
    // cleared once the peer (or a local teardown) already knows we are gone
    let mut notify_peer = true;

    loop {
        tokio::select! {
            result = reader.read(&mut buf), if read_open => match result {
                Ok(0) => {
                    trace!(%tunnel_id, connection_id, "socket reached EOF");
                    send_message(&manager, TunnelMessage::End {
                        tunnel_id: tunnel_id.clone(),
                        connection_id,
                    })
                    .await;
                    read_open = false;
                }
                Ok(n) => {
                    let sent = send_message(&manager, TunnelMessage::Data {
                        tunnel_id: tunnel_id.clone(),
                        connection_id,
                        payload: buf[..n].to_vec(),
                    })
                    .await;
                    if !sent {
                        notify_peer = false;
                        break;
                    }
                }
                Err(err) => {
                    debug!(%tunnel_id, connection_id, "socket read failed: {}", err);
                    break;
                }
            },
            event = events.recv() => match event {
                Some(ConnEvent::Data(payload)) => {
                    if write_open {
                        if let Err(err) = writer.write_all(&payload).await {
                            debug!(%tunnel_id, connection_id, "socket write failed: {}", err);
                            break;
                        }
                    }
                }
                Some(ConnEvent::End) => {
                    trace!(%tunnel_id, connection_id, "peer half-closed");
                    let _ = writer.shutdown().await;
                    write_open = false;
                }
                Some(ConnEvent::Close) | None => {
                    notify_peer = false;
                    break;
                }
            },
        }

        if !read_open && !write_open {
            break;
        }
    }

    if notify_peer {
        send_message(
            &manager,
            TunnelMessage::Close {
                tunnel_id: tunnel_id.clone(),
                connection_id,
            },
        )
        .await;
    }
    unregister(&manager, &tunnel_id, connection_id).await;
    debug!(%tunnel_id, connection_id, "connection finished");
}

async fn send_message(manager: &Weak<ManagerInner>, message: TunnelMessage) -> bool {
    match manager.upgrade() {
        Some(manager) => manager.outbox().send(&message).await.is_ok(),
        None => false,
    }
}

async fn unregister(manager: &Weak<ManagerInner>, tunnel_id: &str, connection_id: ConnectionId) {
    if let Some(manager) = manager.upgrade() {
        manager.remove_connection(tunnel_id, connection_id).await;
    }
}
