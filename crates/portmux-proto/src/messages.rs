//! Protocol message types

use serde::{Deserialize, Serialize};

use crate::{ConnectionId, TunnelId};

/// Main tunnel protocol message enum
///
/// Serialized as a JSON object with a `type` discriminator. Fields beyond
/// the ones listed here are ignored on decode so newer peers can extend
/// messages without breaking older ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelMessage {
    /// Ask the peer to set up the connect-on-demand end of a forward tunnel
    #[serde(rename_all = "camelCase")]
    CreateProxy {
        tunnel_id: TunnelId,
        remote_port: u16,
        #[serde(rename = "useIPv4", default)]
        use_ipv4: bool,
    },

    /// Ask the peer to bind the remote listener of a reverse tunnel
    #[serde(rename_all = "camelCase")]
    CreateReverseProxy { tunnel_id: TunnelId, remote_port: u16 },

    /// Peer finished setting up its end of the tunnel
    #[serde(rename_all = "camelCase")]
    ProxyCreated { tunnel_id: TunnelId },

    /// Peer failed to set up its end of the tunnel
    #[serde(rename_all = "camelCase")]
    ProxyError { tunnel_id: TunnelId, error: PeerError },

    /// The listener side accepted a new client socket
    #[serde(rename_all = "camelCase")]
    NewConnection {
        tunnel_id: TunnelId,
        connection_id: ConnectionId,
    },

    /// One chunk of bytes for a connection, base64 on the wire
    #[serde(rename_all = "camelCase")]
    Data {
        tunnel_id: TunnelId,
        connection_id: ConnectionId,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
    },

    /// The sending side half-closed this connection
    #[serde(rename_all = "camelCase")]
    End {
        tunnel_id: TunnelId,
        connection_id: ConnectionId,
    },

    /// The connection is gone; destroy the matching socket
    #[serde(rename_all = "camelCase")]
    Close {
        tunnel_id: TunnelId,
        connection_id: ConnectionId,
    },

    /// Tear down the named proxy or connector and all of its connections
    #[serde(rename_all = "camelCase")]
    CloseProxy { tunnel_id: TunnelId },
}

impl TunnelMessage {
    /// Tunnel this message belongs to
    pub fn tunnel_id(&self) -> &str {
        match self {
            TunnelMessage::CreateProxy { tunnel_id, .. }
            | TunnelMessage::CreateReverseProxy { tunnel_id, .. }
            | TunnelMessage::ProxyCreated { tunnel_id }
            | TunnelMessage::ProxyError { tunnel_id, .. }
            | TunnelMessage::NewConnection { tunnel_id, .. }
            | TunnelMessage::Data { tunnel_id, .. }
            | TunnelMessage::End { tunnel_id, .. }
            | TunnelMessage::Close { tunnel_id, .. }
            | TunnelMessage::CloseProxy { tunnel_id } => tunnel_id,
        }
    }
}

/// Structured error reported by the peer in `proxyError`
///
/// `code` carries the POSIX-style OS error name (e.g. `EADDRINUSE`) so the
/// requesting side can pattern-match on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            if let Some(code) = &self.code {
                return write!(f, "{}", code);
            }
        }
        write!(f, "{}", self.message)
    }
}

// Serde helper for the `data` payload field
mod base64_payload {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
