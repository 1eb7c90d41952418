//! Connect-on-demand side of a tunnel
//!
//! A connector holds no listener. It waits for the peer to announce accepted
//! connections and dials the target port on loopback for each one.

use std::net::SocketAddr;
use std::sync::Weak;

use portmux_proto::{ConnectionId, TunnelId, TunnelMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::{self, ConnEvent};
use crate::manager::ManagerInner;
use crate::tunnel::IpFamily;

/// Target a connector dials when the peer announces a connection
#[derive(Debug, Clone, Copy)]
pub(crate) struct Connector {
    port: u16,
    family: IpFamily,
}

impl Connector {
    pub(crate) fn new(port: u16, family: IpFamily) -> Self {
        Self { port, family }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.family.loopback(), self.port)
    }
}

/// Dial the connector target for a peer-announced connection and bridge it
///
/// Dial failures answer with `close` so the peer reaps its end.
pub(crate) async fn connect_and_run(
    manager: Weak<ManagerInner>,
    connector: Connector,
    events: mpsc::UnboundedReceiver<ConnEvent>,
    tunnel_id: TunnelId,
    connection_id: ConnectionId,
) {
    let addr = connector.addr();
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            debug!(%tunnel_id, connection_id, %addr, "connected to local target");
            connection::run_connection(manager, stream, events, tunnel_id, connection_id, false)
                .await;
        }
        Err(err) => {
            warn!(%tunnel_id, connection_id, %addr, "failed to connect to local target: {}", err);
            if let Some(manager) = manager.upgrade() {
                let _ = manager
                    .outbox()
                    .send(&TunnelMessage::Close {
                        tunnel_id: tunnel_id.clone(),
                        connection_id,
                    })
                    .await;
                manager.remove_connection(&tunnel_id, connection_id).await;
            }
        }
    }
}
