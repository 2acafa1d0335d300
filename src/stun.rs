//! STUN demultiplexing on SIP ports.
//!
//! The STUN codec lives outside this crate; here we only decide which
//! socket answers a binding request. A request asking for a response from a
//! different source port is served from a short-lived socket bound to the
//! same local address, opened and closed within the transaction.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::manager::opener;
use crate::registry::SocketEntry;
use crate::socket::ProtocolFamily;

/// Response source requested by a STUN binding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    /// Answer from the socket the request arrived on.
    None,
    /// Answer from an alternate port on the same local address.
    Port,
    /// Alternate IP: never offered, never served.
    Ip,
    /// Alternate IP and port: never offered, never served.
    Both,
}

/// Outcome of handing a candidate datagram to the STUN collaborator.
#[derive(Debug, Clone)]
pub enum StunOutcome {
    /// A response to put on the wire, from the socket selected by `change`.
    Respond { payload: Bytes, change: ChangeMode },
    /// Valid STUN, nothing to send back.
    Ignore,
    /// Not a STUN message after all. Expected noise on a shared port.
    NotStun,
}

/// Per-transaction view handed to the STUN collaborator. Discarded once
/// the response is sent or the request is ignored.
#[derive(Debug, Clone)]
pub struct StunEnvironment {
    pub family: ProtocolFamily,
    /// Local address of the receiving socket.
    pub local: SocketAddr,
    /// Source of the request.
    pub remote: SocketAddr,
    /// Port of the alternate responder socket, when one could be opened.
    /// An alternate IP is never available.
    pub alternate_port: Option<u16>,
}

/// Decodes requests and encodes responses. Implemented outside this crate.
pub trait StunHandler: Send + Sync {
    fn handle(&self, env: &StunEnvironment, payload: &[u8]) -> StunOutcome;
}

/// Serve one candidate-STUN datagram received on `entry`.
///
/// Every failure here is logged and swallowed: a malformed or adversarial
/// datagram must never take the receive loop down.
pub(crate) async fn respond(
    handler: &dyn StunHandler,
    entry: &SocketEntry,
    source: SocketAddr,
    payload: &[u8],
) {
    let local = match entry.raw.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("cannot resolve local address for STUN responder: {}", e);
            return;
        }
    };

    // Alternate-port responder on the same local address. The oversized
    // receive buffer of the main IPv6 listener is pointless on a reply-only
    // socket and is skipped.
    let alternate = match opener::open_ephemeral(local.ip()) {
        Ok(socket) => Some(socket),
        Err(e) => {
            warn!("no alternate-port socket for STUN response: {}", e);
            None
        }
    };

    let env = StunEnvironment {
        family: entry.socket.family(),
        local,
        remote: source,
        alternate_port: alternate
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .map(|addr| addr.port()),
    };

    match handler.handle(&env, payload) {
        StunOutcome::Respond { payload, change } => match change {
            ChangeMode::None => {
                if let Err(e) = entry.raw.send_to(&payload, source).await {
                    warn!("STUN response to {} failed: {}", source, e);
                }
            }
            ChangeMode::Port => match &alternate {
                Some(socket) => {
                    if let Err(e) = socket.send_to(&payload, source).await {
                        warn!("STUN alternate-port response to {} failed: {}", source, e);
                    }
                }
                None => {
                    warn!("alternate port requested but no alternate socket is open");
                }
            },
            ChangeMode::Ip | ChangeMode::Both => {
                warn!("unsupported STUN change mode {:?}, not responding", change);
            }
        },
        StunOutcome::Ignore => debug!("STUN handler ignored datagram from {}", source),
        StunOutcome::NotStun => info!("non-STUN datagram from {} on a shared port", source),
    }
    // `alternate` drops here: the ephemeral socket closes on every exit
    // path, including the unsupported-change branches.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{ManagerId, SipSocket};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    struct FixedOutcome {
        outcome: StunOutcome,
        seen_env: Mutex<Option<StunEnvironment>>,
    }

    impl FixedOutcome {
        fn new(outcome: StunOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                seen_env: Mutex::new(None),
            })
        }
    }

    impl StunHandler for FixedOutcome {
        fn handle(&self, env: &StunEnvironment, _payload: &[u8]) -> StunOutcome {
            *self.seen_env.lock().unwrap() = Some(env.clone());
            self.outcome.clone()
        }
    }

    async fn receiving_entry() -> SocketEntry {
        let raw = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = raw.local_addr().unwrap();
        SocketEntry {
            raw,
            socket: SipSocket::new(ProtocolFamily::V4, ManagerId::new(), local_addr),
        }
    }

    #[tokio::test]
    async fn test_respond_on_receiving_socket() {
        let entry = receiving_entry().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handler = FixedOutcome::new(StunOutcome::Respond {
            payload: Bytes::from_static(b"binding-response"),
            change: ChangeMode::None,
        });

        respond(handler.as_ref(), &entry, peer.local_addr().unwrap(), &[0x00, 0x01]).await;

        let mut buf = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"binding-response");
        assert_eq!(from, entry.socket.local_addr());

        let env = handler.seen_env.lock().unwrap().clone().unwrap();
        assert_eq!(env.local, entry.socket.local_addr());
        assert_eq!(env.remote, peer.local_addr().unwrap());
        assert!(env.alternate_port.is_some());
    }

    #[tokio::test]
    async fn test_respond_on_alternate_port() {
        let entry = receiving_entry().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handler = FixedOutcome::new(StunOutcome::Respond {
            payload: Bytes::from_static(b"alt"),
            change: ChangeMode::Port,
        });

        respond(handler.as_ref(), &entry, peer.local_addr().unwrap(), &[0x01]).await;

        let mut buf = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"alt");
        // The reply must come from the advertised alternate port, not the
        // receiving socket.
        let env = handler.seen_env.lock().unwrap().clone().unwrap();
        assert_eq!(from.port(), env.alternate_port.unwrap());
        assert_ne!(from.port(), entry.socket.local_addr().port());
        assert_eq!(from.ip(), entry.socket.local_addr().ip());
    }

    #[tokio::test]
    async fn test_unsupported_change_modes_send_nothing() {
        for change in [ChangeMode::Ip, ChangeMode::Both] {
            let entry = receiving_entry().await;
            let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let handler = FixedOutcome::new(StunOutcome::Respond {
                payload: Bytes::from_static(b"never"),
                change,
            });

            respond(handler.as_ref(), &entry, peer.local_addr().unwrap(), &[0x00]).await;

            let mut buf = [0u8; 8];
            assert!(timeout(Duration::from_millis(200), peer.recv_from(&mut buf))
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn test_ignore_and_not_stun_send_nothing() {
        for outcome in [StunOutcome::Ignore, StunOutcome::NotStun] {
            let entry = receiving_entry().await;
            let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let handler = FixedOutcome::new(outcome);

            respond(handler.as_ref(), &entry, peer.local_addr().unwrap(), &[0x00]).await;

            let mut buf = [0u8; 8];
            assert!(timeout(Duration::from_millis(200), peer.recv_from(&mut buf))
                .await
                .is_err());
        }
    }
}
