//! Wire protocol for the portmux tunnel multiplexer
//!
//! Two `TunnelManager` peers talk over a single message-oriented duplex
//! channel. This crate defines the JSON control messages they exchange and
//! the codec that turns them into transport frames.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, MessageCodec};
pub use messages::{PeerError, TunnelMessage};

/// Identifier for a tunnel, chosen by the side that requested it
pub type TunnelId = String;

/// Identifier for one bytestream connection inside a tunnel, unique within
/// the manager that accepted it
pub type ConnectionId = u64;
