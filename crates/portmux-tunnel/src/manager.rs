//! Tunnel manager: pairs with a remote peer over one message channel and
//! multiplexes TCP connections through it
//!
//! All registry state lives behind a single lock; the dispatch task and the
//! user-facing calls are its only writers. Socket tasks reach shared state
//! only through their event channel and a final unregister call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use portmux_proto::{ConnectionId, MessageCodec, PeerError, TunnelId, TunnelMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{self, ConnEvent};
use crate::connector::{self, Connector};
use crate::error::{os_error_code, TunnelError};
use crate::proxy::{self, ProxyHandle};
use crate::transport::Transport;
use crate::tunnel::{
    IpFamily, Tunnel, TunnelDescriptor, TunnelDirection, TunnelRequest, TunnelShared,
};

/// One end of a tunnel multiplexer pair
///
/// Two managers, one per peer, cooperate over the injected [`Transport`].
/// Either side can open forward or reverse tunnels; identical requests share
/// one refcounted tunnel.
pub struct TunnelManager {
    inner: Arc<ManagerInner>,
}

impl TunnelManager {
    /// Wrap one end of the control channel and start the protocol engine
    pub fn new(transport: impl Transport) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let inner = Arc::new(ManagerInner {
            outbox: Outbox {
                transport: Arc::clone(&transport),
            },
            state: Mutex::new(ManagerState::default()),
            next_connection_id: AtomicU64::new(1),
            dispatch: StdMutex::new(None),
        });

        let dispatch = tokio::spawn(run_dispatch(Arc::clone(&inner), transport));
        if let Ok(mut slot) = inner.dispatch.lock() {
            *slot = Some(dispatch);
        }

        Self { inner }
    }

    /// Open a forward tunnel: a local listener relayed to a port on the peer
    ///
    /// Binds `local_port` on this host, then waits for the peer to confirm
    /// its end before resolving. A request equal to a live tunnel's
    /// descriptor returns another handle to that tunnel instead of binding
    /// twice; concurrent identical requests coalesce the same way.
    pub async fn create_tunnel(&self, request: TunnelRequest) -> Result<Tunnel, TunnelError> {
        ManagerInner::create(&self.inner, request.descriptor()).await
    }

    /// Open a reverse tunnel: the peer binds `remote_port` and relays each
    /// accepted socket back to `local_port` on this host
    pub async fn create_reverse_tunnel(
        &self,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Tunnel, TunnelError> {
        let descriptor = TunnelDescriptor {
            direction: TunnelDirection::Reverse,
            local_port,
            remote_port,
            family: IpFamily::default(),
        };
        ManagerInner::create(&self.inner, descriptor).await
    }

    /// Tear down every tunnel and stop consuming the control channel
    ///
    /// Idempotent. In-flight creates reject with
    /// [`TunnelError::ManagerClosed`], as does every later create call.
    /// Sockets are destroyed without draining.
    pub async fn close(&self) {
        self.inner.shutdown(CloseReason::UserClosed).await;
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Descriptors of tunnels currently established through this manager
    pub async fn active_tunnels(&self) -> Vec<TunnelDescriptor> {
        let state = self.inner.state.lock().await;
        state
            .tunnels
            .iter()
            .filter(|(_, slot)| matches!(slot, TunnelSlot::Ready(_)))
            .map(|(descriptor, _)| *descriptor)
            .collect()
    }
}

/// Why the manager is going away; decides what in-flight creates see
#[derive(Debug, Clone, Copy)]
enum CloseReason {
    UserClosed,
    TransportEnded,
}

impl CloseReason {
    fn to_error(self) -> TunnelError {
        match self {
            CloseReason::UserClosed => TunnelError::ManagerClosed,
            CloseReason::TransportEnded => TunnelError::TransportClosed,
        }
    }
}

/// Serializes and sends outbound messages over the shared transport
pub(crate) struct Outbox {
    transport: Arc<dyn Transport>,
}

impl Outbox {
    pub(crate) async fn send(&self, message: &TunnelMessage) -> Result<(), TunnelError> {
        let encoded = MessageCodec::encode(message)?;
        self.transport.send(encoded).await?;
        Ok(())
    }
}

/// A descriptor's slot in the dedup cache
enum TunnelSlot {
    /// First create still in flight; later callers park here
    Pending(Vec<oneshot::Sender<Result<Tunnel, TunnelError>>>),
    Ready(ActiveTunnel),
}

struct ActiveTunnel {
    shared: Arc<TunnelShared>,
    refcount: usize,
}

struct ConnectionHandle {
    events: mpsc::UnboundedSender<ConnEvent>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    closed: bool,
    tunnels: HashMap<TunnelDescriptor, TunnelSlot>,
    pending_creates: HashMap<TunnelId, oneshot::Sender<Result<(), TunnelError>>>,
    proxies: HashMap<TunnelId, ProxyHandle>,
    connectors: HashMap<TunnelId, Connector>,
    connections: HashMap<TunnelId, HashMap<ConnectionId, ConnectionHandle>>,
}

pub(crate) struct ManagerInner {
    outbox: Outbox,
    state: Mutex<ManagerState>,
    next_connection_id: AtomicU64,
    dispatch: StdMutex<Option<JoinHandle<()>>>,
}

impl ManagerInner {
    pub(crate) fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    async fn create(
        inner: &Arc<ManagerInner>,
        descriptor: TunnelDescriptor,
    ) -> Result<Tunnel, TunnelError> {
        let parked = {
            let mut state = inner.state.lock().await;
            if state.closed {
                return Err(TunnelError::ManagerClosed);
            }
            match state.tunnels.get_mut(&descriptor) {
                Some(TunnelSlot::Ready(active)) => {
                    active.refcount += 1;
                    debug!(
                        tunnel_id = %active.shared.id,
                        refcount = active.refcount,
                        "reusing existing tunnel"
                    );
                    return Ok(Tunnel::new(active.shared.clone()));
                }
                Some(TunnelSlot::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    state.tunnels.insert(descriptor, TunnelSlot::Pending(Vec::new()));
                    None
                }
            }
        };

        if let Some(rx) = parked {
            return rx.await.unwrap_or(Err(TunnelError::ManagerClosed));
        }

        match Self::establish(inner, descriptor).await {
            Ok(tunnel) => Ok(tunnel),
            Err(err) => {
                // wake anyone who piled onto this descriptor meanwhile
                let mut state = inner.state.lock().await;
                if let Some(TunnelSlot::Pending(waiters)) = state.tunnels.remove(&descriptor) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(err.duplicate()));
                    }
                }
                Err(err)
            }
        }
    }

    async fn establish(
        inner: &Arc<ManagerInner>,
        descriptor: TunnelDescriptor,
    ) -> Result<Tunnel, TunnelError> {
        let tunnel_id: TunnelId = Uuid::new_v4().to_string();

        // Forward tunnels own the local listener; bind before any protocol
        // traffic so a conflict surfaces as the plain OS error.
        let listener = match descriptor.direction {
            TunnelDirection::Forward => {
                let ip = descriptor.family.unspecified();
                match TcpListener::bind((ip, descriptor.local_port)).await {
                    Ok(listener) => Some(listener),
                    Err(source) => {
                        return Err(TunnelError::bind(ip, descriptor.local_port, source));
                    }
                }
            }
            TunnelDirection::Reverse => None,
        };

        // Register the response slot, and for reverse tunnels the connector,
        // before the request hits the wire so the peer's reply and any early
        // newConnection always find their target.
        let response = {
            let (tx, rx) = oneshot::channel();
            let mut state = inner.state.lock().await;
            if state.closed {
                return Err(TunnelError::ManagerClosed);
            }
            state.pending_creates.insert(tunnel_id.clone(), tx);
            if descriptor.direction == TunnelDirection::Reverse {
                state.connectors.insert(
                    tunnel_id.clone(),
                    Connector::new(descriptor.local_port, descriptor.family),
                );
            }
            rx
        };

        let request = match descriptor.direction {
            TunnelDirection::Forward => TunnelMessage::CreateProxy {
                tunnel_id: tunnel_id.clone(),
                remote_port: descriptor.remote_port,
                use_ipv4: descriptor.family == IpFamily::V4,
            },
            TunnelDirection::Reverse => TunnelMessage::CreateReverseProxy {
                tunnel_id: tunnel_id.clone(),
                remote_port: descriptor.remote_port,
            },
        };

        if let Err(err) = inner.outbox.send(&request).await {
            inner.forget_create(&tunnel_id).await;
            return Err(err);
        }

        debug!(%tunnel_id, ?descriptor, "awaiting peer acknowledgement");
        match response.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                inner.forget_create(&tunnel_id).await;
                return Err(err);
            }
            Err(_) => {
                inner.forget_create(&tunnel_id).await;
                return Err(TunnelError::ManagerClosed);
            }
        }

        // Peer is ready; wire up our end and publish the tunnel.
        let shared = Arc::new(TunnelShared {
            id: tunnel_id.clone(),
            descriptor,
            manager: Arc::downgrade(inner),
        });

        let mut state = inner.state.lock().await;
        if state.closed {
            return Err(TunnelError::ManagerClosed);
        }
        if let Some(listener) = listener {
            let task = tokio::spawn(proxy::run_proxy(
                listener,
                tunnel_id.clone(),
                Arc::downgrade(inner),
            ));
            state.proxies.insert(tunnel_id.clone(), ProxyHandle { task });
        }

        let waiters = match state.tunnels.get_mut(&descriptor) {
            Some(TunnelSlot::Pending(waiters)) => std::mem::take(waiters),
            _ => Vec::new(),
        };
        let mut refcount = 1;
        for waiter in waiters {
            // each parked caller gets its own handle against the same tunnel
            if waiter.send(Ok(Tunnel::new(shared.clone()))).is_ok() {
                refcount += 1;
            }
        }
        state.tunnels.insert(
            descriptor,
            TunnelSlot::Ready(ActiveTunnel {
                shared: shared.clone(),
                refcount,
            }),
        );
        info!(%tunnel_id, ?descriptor, "tunnel established");

        Ok(Tunnel::new(shared))
    }

    async fn forget_create(&self, tunnel_id: &str) {
        let mut state = self.state.lock().await;
        state.pending_creates.remove(tunnel_id);
        state.connectors.remove(tunnel_id);
    }

    /// Drop one handle's reference; the last one tears the tunnel down
    pub(crate) async fn release_tunnel(&self, descriptor: &TunnelDescriptor) {
        let teardown = {
            let mut state = self.state.lock().await;
            match state.tunnels.get_mut(descriptor) {
                Some(TunnelSlot::Ready(active)) => {
                    active.refcount -= 1;
                    if active.refcount == 0 {
                        let tunnel_id = active.shared.id.clone();
                        state.tunnels.remove(descriptor);
                        Some(tunnel_id)
                    } else {
                        debug!(
                            tunnel_id = %active.shared.id,
                            refcount = active.refcount,
                            "tunnel handle released"
                        );
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(tunnel_id) = teardown {
            info!(%tunnel_id, "last handle closed; tearing down tunnel");
            let _ = self
                .outbox
                .send(&TunnelMessage::CloseProxy {
                    tunnel_id: tunnel_id.clone(),
                })
                .await;
            self.teardown_endpoint(&tunnel_id).await;
        }
    }

    /// Remove a tunnel's listener, connector, and connections on this side
    async fn teardown_endpoint(&self, tunnel_id: &str) {
        let (proxy, connections) = {
            let mut state = self.state.lock().await;
            state.connectors.remove(tunnel_id);
            (
                state.proxies.remove(tunnel_id),
                state.connections.remove(tunnel_id),
            )
        };

        if let Some(connections) = connections {
            for (_, conn) in connections {
                // queued behind any data already dispatched, so those bytes
                // still land before the socket goes away
                let _ = conn.events.send(ConnEvent::Close);
            }
        }
        if let Some(proxy) = proxy {
            proxy.task.abort();
            let _ = proxy.task.await;
        }
    }

    async fn shutdown(&self, reason: CloseReason) {
        let (pending, tunnels, proxies, connections) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.connectors.clear();
            (
                state.pending_creates.drain().collect::<Vec<_>>(),
                state.tunnels.drain().collect::<Vec<_>>(),
                state.proxies.drain().collect::<Vec<_>>(),
                state.connections.drain().collect::<Vec<_>>(),
            )
        };

        debug!(?reason, "closing tunnel manager");

        for (_, waiter) in pending {
            let _ = waiter.send(Err(reason.to_error()));
        }
        for (_, slot) in tunnels {
            if let TunnelSlot::Pending(waiters) = slot {
                for waiter in waiters {
                    let _ = waiter.send(Err(reason.to_error()));
                }
            }
        }
        for (_, conns) in connections {
            for (_, conn) in conns {
                let _ = conn.events.send(ConnEvent::Close);
                conn.task.abort();
            }
        }
        for (_, proxy) in proxies {
            proxy.task.abort();
            let _ = proxy.task.await;
        }

        // Stop consuming the inbound stream last so a shutdown triggered
        // from the dispatch task itself still completes the teardown above.
        if let Ok(mut slot) = self.dispatch.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    /// Register a socket accepted by one of our listeners
    pub(crate) async fn adopt_connection(
        inner: &Arc<ManagerInner>,
        tunnel_id: &TunnelId,
        stream: TcpStream,
    ) {
        let connection_id = inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut state = inner.state.lock().await;
        if state.closed || !state.proxies.contains_key(tunnel_id) {
            // raced with teardown; just drop the socket
            return;
        }
        let task = tokio::spawn(connection::run_connection(
            Arc::downgrade(inner),
            stream,
            events_rx,
            tunnel_id.clone(),
            connection_id,
            true,
        ));
        state
            .connections
            .entry(tunnel_id.clone())
            .or_default()
            .insert(connection_id, ConnectionHandle { events: events_tx, task });
    }

    /// Register a connection the peer announced and dial its target
    async fn accept_peer_connection(
        inner: &Arc<ManagerInner>,
        tunnel_id: TunnelId,
        connection_id: ConnectionId,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut state = inner.state.lock().await;
        if state.closed {
            return;
        }
        let Some(connector) = state.connectors.get(&tunnel_id).copied() else {
            drop(state);
            warn!(%tunnel_id, connection_id, "newConnection for unknown tunnel");
            let _ = inner
                .outbox
                .send(&TunnelMessage::Close {
                    tunnel_id,
                    connection_id,
                })
                .await;
            return;
        };
        let conns = state.connections.entry(tunnel_id.clone()).or_default();
        if conns.contains_key(&connection_id) {
            warn!(%tunnel_id, connection_id, "duplicate connection id from peer");
            return;
        }
        let task = tokio::spawn(connector::connect_and_run(
            Arc::downgrade(inner),
            connector,
            events_rx,
            tunnel_id.clone(),
            connection_id,
        ));
        conns.insert(connection_id, ConnectionHandle { events: events_tx, task });
    }

    pub(crate) async fn remove_connection(&self, tunnel_id: &str, connection_id: ConnectionId) {
        let mut state = self.state.lock().await;
        if let Some(conns) = state.connections.get_mut(tunnel_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                state.connections.remove(tunnel_id);
            }
        }
    }

    /// Peer asked us to run the connect-on-demand end of a forward tunnel
    async fn handle_create_proxy(
        inner: &Arc<ManagerInner>,
        tunnel_id: TunnelId,
        remote_port: u16,
        use_ipv4: bool,
    ) {
        let family = if use_ipv4 { IpFamily::V4 } else { IpFamily::V6 };
        {
            let mut state = inner.state.lock().await;
            if state.closed {
                return;
            }
            state
                .connectors
                .insert(tunnel_id.clone(), Connector::new(remote_port, family));
        }
        debug!(%tunnel_id, remote_port, "registered connector for forward tunnel");
        if let Err(err) = inner
            .outbox
            .send(&TunnelMessage::ProxyCreated { tunnel_id: tunnel_id.clone() })
            .await
        {
            warn!(%tunnel_id, "failed to acknowledge createProxy: {}", err);
        }
    }

    /// Peer asked us to bind the remote listener of a reverse tunnel
    async fn handle_create_reverse_proxy(
        inner: &Arc<ManagerInner>,
        tunnel_id: TunnelId,
        remote_port: u16,
    ) {
        let ip = IpFamily::V6.unspecified();
        match TcpListener::bind((ip, remote_port)).await {
            Ok(listener) => {
                {
                    let mut state = inner.state.lock().await;
                    if state.closed {
                        return;
                    }
                    let task = tokio::spawn(proxy::run_proxy(
                        listener,
                        tunnel_id.clone(),
                        Arc::downgrade(inner),
                    ));
                    state.proxies.insert(tunnel_id.clone(), ProxyHandle { task });
                }
                debug!(%tunnel_id, remote_port, "bound reverse tunnel listener");
                if let Err(err) = inner
                    .outbox
                    .send(&TunnelMessage::ProxyCreated { tunnel_id: tunnel_id.clone() })
                    .await
                {
                    warn!(%tunnel_id, "failed to acknowledge createReverseProxy: {}", err);
                }
            }
            Err(source) => {
                warn!(%tunnel_id, remote_port, "reverse tunnel bind failed: {}", source);
                let code = os_error_code(&source);
                let error = PeerError {
                    code: Some(code.to_string()),
                    message: format!("listen {} {}:{}", code, ip, remote_port),
                };
                let _ = inner
                    .outbox
                    .send(&TunnelMessage::ProxyError { tunnel_id, error })
                    .await;
            }
        }
    }

    async fn handle_message(inner: &Arc<ManagerInner>, message: TunnelMessage) {
        match message {
            TunnelMessage::CreateProxy {
                tunnel_id,
                remote_port,
                use_ipv4,
            } => {
                Self::handle_create_proxy(inner, tunnel_id, remote_port, use_ipv4).await;
            }
            TunnelMessage::CreateReverseProxy {
                tunnel_id,
                remote_port,
            } => {
                Self::handle_create_reverse_proxy(inner, tunnel_id, remote_port).await;
            }
            TunnelMessage::ProxyCreated { tunnel_id } => {
                let waiter = inner.state.lock().await.pending_creates.remove(&tunnel_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => debug!(%tunnel_id, "proxyCreated for unknown create"),
                }
            }
            TunnelMessage::ProxyError { tunnel_id, error } => {
                let waiter = inner.state.lock().await.pending_creates.remove(&tunnel_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Err(TunnelError::Remote(error)));
                    }
                    None => warn!(%tunnel_id, "proxyError for unknown create: {}", error),
                }
            }
            TunnelMessage::NewConnection {
                tunnel_id,
                connection_id,
            } => {
                Self::accept_peer_connection(inner, tunnel_id, connection_id).await;
            }
            TunnelMessage::Data {
                tunnel_id,
                connection_id,
                payload,
            } => {
                let state = inner.state.lock().await;
                if let Some(conn) = state
                    .connections
                    .get(&tunnel_id)
                    .and_then(|conns| conns.get(&connection_id))
                {
                    // the connection may be mid-teardown; a failed send is
                    // the same no-op as an unknown id
                    let _ = conn.events.send(ConnEvent::Data(Bytes::from(payload)));
                }
            }
            TunnelMessage::End {
                tunnel_id,
                connection_id,
            } => {
                let state = inner.state.lock().await;
                if let Some(conn) = state
                    .connections
                    .get(&tunnel_id)
                    .and_then(|conns| conns.get(&connection_id))
                {
                    let _ = conn.events.send(ConnEvent::End);
                }
            }
            TunnelMessage::Close {
                tunnel_id,
                connection_id,
            } => {
                let mut state = inner.state.lock().await;
                if let Some(conns) = state.connections.get_mut(&tunnel_id) {
                    if let Some(conn) = conns.remove(&connection_id) {
                        let _ = conn.events.send(ConnEvent::Close);
                    }
                    if conns.is_empty() {
                        state.connections.remove(&tunnel_id);
                    }
                }
            }
            TunnelMessage::CloseProxy { tunnel_id } => {
                debug!(%tunnel_id, "peer closed tunnel");
                inner.teardown_endpoint(&tunnel_id).await;
            }
        }
    }
}

/// Consume the inbound message stream until the carrier ends
async fn run_dispatch(inner: Arc<ManagerInner>, transport: Arc<dyn Transport>) {
    loop {
        match transport.recv().await {
            Ok(Some(raw)) => match MessageCodec::decode(&raw) {
                Ok(message) => ManagerInner::handle_message(&inner, message).await,
                Err(err) => warn!("ignoring malformed control message: {}", err),
            },
            Ok(None) => {
                debug!("control channel ended");
                inner.shutdown(CloseReason::TransportEnded).await;
                break;
            }
            Err(err) => {
                warn!("control channel failed: {}", err);
                inner.shutdown(CloseReason::TransportEnded).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv_json(peer: &ChannelTransport) -> serde_json::Value {
        let raw = timeout(Duration::from_secs(5), peer.recv())
            .await
            .expect("timed out waiting for a control message")
            .unwrap()
            .expect("control channel ended unexpectedly");
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_create_proxy_is_acknowledged() {
        let (ours, theirs) = ChannelTransport::pair();
        let _manager = TunnelManager::new(ours);

        theirs
            .send(
                r#"{"type":"createProxy","tunnelId":"t-1","remotePort":45001,"useIPv4":false}"#
                    .to_string(),
            )
            .await
            .unwrap();

        let reply = recv_json(&theirs).await;
        assert_eq!(reply["type"], "proxyCreated");
        assert_eq!(reply["tunnelId"], "t-1");
    }

    #[tokio::test]
    async fn test_malformed_messages_are_ignored() {
        let (ours, theirs) = ChannelTransport::pair();
        let _manager = TunnelManager::new(ours);

        theirs.send("not json at all".to_string()).await.unwrap();
        theirs
            .send(r#"{"type":"heartbeat"}"#.to_string())
            .await
            .unwrap();
        theirs
            .send(
                r#"{"type":"createProxy","tunnelId":"t-2","remotePort":45002,"useIPv4":true}"#
                    .to_string(),
            )
            .await
            .unwrap();

        // the engine is still alive and answers the valid message
        let reply = recv_json(&theirs).await;
        assert_eq!(reply["type"], "proxyCreated");
        assert_eq!(reply["tunnelId"], "t-2");
    }

    #[tokio::test]
    async fn test_reverse_proxy_bind_conflict_reports_error() {
        let blocker = TcpListener::bind(("::", 0)).await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let (ours, theirs) = ChannelTransport::pair();
        let _manager = TunnelManager::new(ours);

        theirs
            .send(format!(
                r#"{{"type":"createReverseProxy","tunnelId":"t-3","remotePort":{}}}"#,
                port
            ))
            .await
            .unwrap();

        let reply = recv_json(&theirs).await;
        assert_eq!(reply["type"], "proxyError");
        assert_eq!(reply["tunnelId"], "t-3");
        assert_eq!(reply["error"]["code"], "EADDRINUSE");
    }

    #[tokio::test]
    async fn test_new_connection_for_unknown_tunnel_answers_close() {
        let (ours, theirs) = ChannelTransport::pair();
        let _manager = TunnelManager::new(ours);

        theirs
            .send(r#"{"type":"newConnection","tunnelId":"t-9","connectionId":1}"#.to_string())
            .await
            .unwrap();

        let reply = recv_json(&theirs).await;
        assert_eq!(reply["type"], "close");
        assert_eq!(reply["tunnelId"], "t-9");
        assert_eq!(reply["connectionId"], 1);
    }

    #[tokio::test]
    async fn test_data_for_unknown_connection_is_dropped() {
        let (ours, theirs) = ChannelTransport::pair();
        let manager = TunnelManager::new(ours);

        theirs
            .send(
                r#"{"type":"data","tunnelId":"t-4","connectionId":9,"payload":"aGk="}"#.to_string(),
            )
            .await
            .unwrap();
        theirs
            .send(r#"{"type":"close","tunnelId":"t-4","connectionId":9}"#.to_string())
            .await
            .unwrap();

        // the engine still serves new requests afterwards
        theirs
            .send(
                r#"{"type":"createProxy","tunnelId":"t-5","remotePort":45003,"useIPv4":false}"#
                    .to_string(),
            )
            .await
            .unwrap();
        let reply = recv_json(&theirs).await;
        assert_eq!(reply["type"], "proxyCreated");
        assert!(!manager.is_closed().await);
    }

    #[tokio::test]
    async fn test_transport_end_closes_manager() {
        let (ours, theirs) = ChannelTransport::pair();
        let manager = TunnelManager::new(ours);

        drop(theirs);
        // give the dispatch task a moment to observe the closed carrier
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.is_closed().await);
        let err = manager
            .create_tunnel(TunnelRequest::new(45010, 45011))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ManagerClosed));
    }
}
