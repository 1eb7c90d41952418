//! Tunnel identity and the refcounted user handle

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use portmux_proto::TunnelId;

use crate::manager::ManagerInner;

/// Address family a tunnel listens and dials on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpFamily {
    V4,
    #[default]
    V6,
}

impl IpFamily {
    /// Wildcard address listeners bind to
    pub(crate) fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Loopback address connectors dial
    pub(crate) fn loopback(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// Direction of a tunnel relative to the manager that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelDirection {
    /// Listener on this side, peer dials its target on demand
    Forward,
    /// Listener on the peer, this side dials the local target
    Reverse,
}

/// Immutable identity of a tunnel
///
/// Two descriptors are equal iff all fields match; each manager keeps at
/// most one live tunnel per descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelDescriptor {
    pub direction: TunnelDirection,
    pub local_port: u16,
    pub remote_port: u16,
    pub family: IpFamily,
}

/// Parameters for [`crate::TunnelManager::create_tunnel`]
#[derive(Debug, Clone, Copy)]
pub struct TunnelRequest {
    pub local_port: u16,
    pub remote_port: u16,
    pub family: IpFamily,
}

impl TunnelRequest {
    /// Forward-tunnel request with the default (IPv6) family
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
            family: IpFamily::default(),
        }
    }

    pub fn with_family(mut self, family: IpFamily) -> Self {
        self.family = family;
        self
    }

    pub(crate) fn descriptor(&self) -> TunnelDescriptor {
        TunnelDescriptor {
            direction: TunnelDirection::Forward,
            local_port: self.local_port,
            remote_port: self.remote_port,
            family: self.family,
        }
    }
}

pub(crate) struct TunnelShared {
    pub(crate) id: TunnelId,
    pub(crate) descriptor: TunnelDescriptor,
    pub(crate) manager: Weak<ManagerInner>,
}

/// Refcounted handle to a live tunnel
///
/// Repeat create calls with an equal descriptor return handles to the same
/// underlying tunnel; handles compare equal iff they share a tunnel id. The
/// tunnel stays up until every outstanding handle is closed, or its manager
/// shuts down.
pub struct Tunnel {
    shared: Arc<TunnelShared>,
    closed: AtomicBool,
}

impl Tunnel {
    pub(crate) fn new(shared: Arc<TunnelShared>) -> Self {
        Self {
            shared,
            closed: AtomicBool::new(false),
        }
    }

    /// Id shared by every handle to the same underlying tunnel
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn descriptor(&self) -> TunnelDescriptor {
        self.shared.descriptor
    }

    /// Release this handle
    ///
    /// The tunnel is torn down when the last outstanding handle is closed.
    /// Extra calls on one handle are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.release_tunnel(&self.shared.descriptor).await;
        }
    }
}

impl PartialEq for Tunnel {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Tunnel {}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.shared.id)
            .field("descriptor", &self.shared.descriptor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_equality() {
        let a = TunnelDescriptor {
            direction: TunnelDirection::Forward,
            local_port: 8080,
            remote_port: 9090,
            family: IpFamily::V6,
        };
        let b = a;
        assert_eq!(a, b);

        let different_direction = TunnelDescriptor {
            direction: TunnelDirection::Reverse,
            ..a
        };
        assert_ne!(a, different_direction);

        let different_family = TunnelDescriptor {
            family: IpFamily::V4,
            ..a
        };
        assert_ne!(a, different_family);
    }

    #[test]
    fn test_request_defaults_to_ipv6() {
        let request = TunnelRequest::new(8080, 9090);
        assert_eq!(request.family, IpFamily::V6);

        let descriptor = request.descriptor();
        assert_eq!(descriptor.direction, TunnelDirection::Forward);
        assert_eq!(descriptor.local_port, 8080);
        assert_eq!(descriptor.remote_port, 9090);
    }

    #[test]
    fn test_family_addresses() {
        assert_eq!(IpFamily::V4.unspecified().to_string(), "0.0.0.0");
        assert_eq!(IpFamily::V6.unspecified().to_string(), "::");
        assert_eq!(IpFamily::V4.loopback().to_string(), "127.0.0.1");
        assert_eq!(IpFamily::V6.loopback().to_string(), "::1");
    }
}
