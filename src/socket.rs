use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use uuid::Uuid;

/// Protocol family of a transport socket. This crate only carries UDP; the
/// TCP and TLS transports are separate crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    V4,
    V6,
}

impl ProtocolFamily {
    /// Family of a bound or destination address.
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            ProtocolFamily::V4
        } else {
            ProtocolFamily::V6
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFamily::V4 => write!(f, "UDPv4"),
            ProtocolFamily::V6 => write!(f, "UDPv6"),
        }
    }
}

/// Identity of the managing task that owns a set of sockets. Keys the
/// socket registry together with a protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(Uuid);

impl ManagerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manager-{}", self.0)
    }
}

/// Flow identity: pins an outbound send to the specific bound socket a flow
/// was established on. Minted once at bind time; unique for the lifetime of
/// the owning manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    family: ProtocolFamily,
    token: Uuid,
}

impl FlowId {
    pub(crate) fn mint(family: ProtocolFamily) -> Self {
        Self {
            family,
            token: Uuid::new_v4(),
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.token)
    }
}

/// A logical transport-layer socket handle.
///
/// Immutable after creation: one is minted per bound OS socket at startup
/// (or runtime bind) and lives until the owning manager shuts down. UDP
/// sockets are not individually closable in this design, so there is no
/// per-socket close operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipSocket {
    family: ProtocolFamily,
    owner: ManagerId,
    local_addr: SocketAddr,
    flow_id: FlowId,
}

impl SipSocket {
    pub(crate) fn new(family: ProtocolFamily, owner: ManagerId, local_addr: SocketAddr) -> Self {
        Self {
            family,
            owner,
            local_addr,
            flow_id: FlowId::mint(family),
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    pub fn owner(&self) -> ManagerId {
        self.owner
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

impl fmt::Display for SipSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.family, self.local_addr)
    }
}

/// Where an accepted SIP datagram came from.
///
/// Constructed fresh per datagram and consumed by the processing pipeline
/// together with the payload.
#[derive(Debug, Clone)]
pub struct Origin {
    /// Family of the receiving socket.
    pub family: ProtocolFamily,
    /// Source address and port as observed on the wire.
    pub source: SocketAddr,
    /// The OS socket the datagram arrived on.
    pub raw_socket: Arc<UdpSocket>,
    /// The logical handle of the receiving socket.
    pub socket: SipSocket,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_of_addr() {
        let v4: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let v6: SocketAddr = "[::1]:5060".parse().unwrap();
        assert_eq!(ProtocolFamily::of(&v4), ProtocolFamily::V4);
        assert_eq!(ProtocolFamily::of(&v6), ProtocolFamily::V6);
    }

    #[test]
    fn test_flow_ids_are_unique() {
        let a = FlowId::mint(ProtocolFamily::V4);
        let b = FlowId::mint(ProtocolFamily::V4);
        assert_ne!(a, b);
        assert_eq!(a.family(), b.family());
    }

    #[test]
    fn test_sockets_with_same_addr_have_distinct_flows() {
        let owner = ManagerId::new();
        let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let one = SipSocket::new(ProtocolFamily::V4, owner, addr);
        let two = SipSocket::new(ProtocolFamily::V4, owner, addr);
        assert_eq!(one.local_addr(), two.local_addr());
        assert_ne!(one.flow_id(), two.flow_id());
    }

    #[test]
    fn test_display() {
        let owner = ManagerId::new();
        let addr: SocketAddr = "[::1]:5060".parse().unwrap();
        let socket = SipSocket::new(ProtocolFamily::V6, owner, addr);
        assert_eq!(socket.to_string(), "UDPv6@[::1]:5060");
    }
}
