//! Bidirectional TCP port-forwarding multiplexer
//!
//! portmux rides on a single pre-established, message-oriented control link
//! between two peers. Each side runs a [`TunnelManager`]; together they relay
//! many independent TCP bytestreams over that one channel.
//!
//! A **forward** tunnel binds a listener on the requesting side and has the
//! peer dial a target port on its host for every accepted client. A
//! **reverse** tunnel asks the peer to bind the listener instead, relaying
//! its clients back to a local port.
//!
//! # Example
//!
//! ```rust,no_run
//! use portmux_tunnel::{ChannelTransport, TunnelManager, TunnelRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Two managers wired back to back; in production each end wraps its
//!     // side of a real duplex carrier instead.
//!     let (near, far) = ChannelTransport::pair();
//!     let client = TunnelManager::new(near);
//!     let _server = TunnelManager::new(far);
//!
//!     // Relay connections to local port 8080 over to port 9090 on the peer.
//!     let tunnel = client.create_tunnel(TunnelRequest::new(8080, 9090)).await?;
//!
//!     // ... traffic flows ...
//!
//!     tunnel.close().await;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod connection;
mod connector;
mod proxy;

pub mod error;
pub mod manager;
pub mod transport;
pub mod tunnel;

pub use error::TunnelError;
pub use manager::TunnelManager;
pub use transport::{ChannelTransport, Transport, TransportError};
pub use tunnel::{IpFamily, Tunnel, TunnelDescriptor, TunnelDirection, TunnelRequest};
