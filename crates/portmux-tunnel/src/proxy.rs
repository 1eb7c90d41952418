//! Listener side of a tunnel

use std::sync::Weak;

use portmux_proto::TunnelId;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::manager::ManagerInner;

/// Handle to a running accept loop, tracked for teardown
pub(crate) struct ProxyHandle {
    pub(crate) task: JoinHandle<()>,
}

/// Accept local sockets for a tunnel and hand each one to a bridging task
pub(crate) async fn run_proxy(
    listener: TcpListener,
    tunnel_id: TunnelId,
    manager: Weak<ManagerInner>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(%tunnel_id, %peer_addr, "accepted tunnel client");
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                ManagerInner::adopt_connection(&manager, &tunnel_id, stream).await;
            }
            Err(err) => {
                error!(%tunnel_id, "failed to accept connection: {}", err);
            }
        }
    }
    debug!(%tunnel_id, "accept loop ended");
}
