//! Error types for the tunnel engine

use std::io;
use std::net::IpAddr;

use portmux_proto::{CodecError, PeerError};
use thiserror::Error;

use crate::transport::TransportError;

/// Tunnel engine errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The manager was closed before or during the operation
    #[error("tunnel manager is closed")]
    ManagerClosed,

    /// Binding the local listener failed
    #[error("listen {code} {ip}:{port}")]
    Bind {
        /// POSIX-style name of the OS error, e.g. `EADDRINUSE`
        code: &'static str,
        ip: IpAddr,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The peer failed to set up its end of the tunnel
    #[error("remote proxy error: {0}")]
    Remote(PeerError),

    /// The underlying message channel ended
    #[error("transport closed")]
    TransportClosed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// POSIX-style error code for bind failures, local or remote
    pub fn code(&self) -> Option<&str> {
        match self {
            TunnelError::Bind { code, .. } => Some(code),
            TunnelError::Remote(err) => err.code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn bind(ip: IpAddr, port: u16, source: io::Error) -> Self {
        TunnelError::Bind {
            code: os_error_code(&source),
            ip,
            port,
            source,
        }
    }

    /// Best-effort copy for fanning one failure out to coalesced callers
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            TunnelError::ManagerClosed => TunnelError::ManagerClosed,
            TunnelError::TransportClosed => TunnelError::TransportClosed,
            TunnelError::Bind {
                code,
                ip,
                port,
                source,
            } => TunnelError::Bind {
                code: *code,
                ip: *ip,
                port: *port,
                source: io::Error::new(source.kind(), source.to_string()),
            },
            TunnelError::Remote(err) => TunnelError::Remote(err.clone()),
            TunnelError::Transport(err) => TunnelError::Transport(err.clone()),
            other => TunnelError::Io(io::Error::other(other.to_string())),
        }
    }
}

/// Map an IO error to the matching POSIX-style code name
pub(crate) fn os_error_code(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::AddrInUse => "EADDRINUSE",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        _ => "EUNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display_ipv6_wildcard() {
        let err = TunnelError::bind(
            "::".parse().unwrap(),
            8080,
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert_eq!(err.to_string(), "listen EADDRINUSE :::8080");
        assert_eq!(err.code(), Some("EADDRINUSE"));
    }

    #[test]
    fn test_bind_error_display_ipv4() {
        let err = TunnelError::bind(
            "0.0.0.0".parse().unwrap(),
            80,
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.to_string(), "listen EACCES 0.0.0.0:80");
        assert_eq!(err.code(), Some("EACCES"));
    }

    #[test]
    fn test_remote_error_preserves_peer_code() {
        let err = TunnelError::Remote(PeerError {
            code: Some("EADDRINUSE".to_string()),
            message: "listen EADDRINUSE :::9000".to_string(),
        });
        assert_eq!(err.code(), Some("EADDRINUSE"));
        assert!(err.to_string().contains("listen EADDRINUSE :::9000"));
    }

    #[test]
    fn test_duplicate_keeps_code_and_kind() {
        let original = TunnelError::bind(
            "::".parse().unwrap(),
            8080,
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        let copy = original.duplicate();
        assert_eq!(copy.code(), Some("EADDRINUSE"));
        assert_eq!(copy.to_string(), original.to_string());
    }
}
