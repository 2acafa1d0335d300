//! Outbound sends against registry snapshots.
//!
//! Sends bypass the socket manager entirely: concurrent senders read the
//! published snapshot and write straight to the OS sockets, so send
//! throughput never serializes against the receive loop.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::registry::{SocketEntry, SocketRegistry};
use crate::socket::{ProtocolFamily, SipSocket};

/// Sends SIP payloads through the best-ranked registered socket.
#[derive(Debug, Clone)]
pub struct UdpSender {
    registry: SocketRegistry,
}

impl UdpSender {
    pub fn new(registry: SocketRegistry) -> Self {
        Self { registry }
    }

    /// Send `payload` to `host:port`.
    ///
    /// The socket that carried the flow (`preferred`) is tried first, then
    /// any sibling socket bound to the same local address, then the rest of
    /// the registered set: a manager may hold sockets on several local
    /// addresses and the caller does not always know which one routes to a
    /// given destination.
    pub async fn send(
        &self,
        preferred: &SipSocket,
        family: ProtocolFamily,
        host: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<usize> {
        if family != preferred.family() {
            return Err(Error::ProtocolMismatch {
                requested: family,
                bound: preferred.family(),
            });
        }
        let dest = SocketAddr::new(parse_host(host, family)?, port);

        let snapshot = self
            .registry
            .snapshot(preferred.owner(), family)
            .ok_or(Error::NoSocket)?;

        for entry in ranked(&snapshot, preferred) {
            match entry.raw.send_to(payload, dest).await {
                Ok(sent) => {
                    trace!("sent {} bytes to {} via {}", sent, dest, entry.socket);
                    return Ok(sent);
                }
                // This socket is bound to a family the destination is not
                // reachable from; a sibling may still route it.
                Err(ref e) if is_family_mismatch(e) => {
                    debug!("{} cannot reach {}, trying next candidate", entry.socket, dest);
                }
                Err(e) => return Err(Error::SendFailed(dest, e)),
            }
        }

        Err(Error::NoSocket)
    }
}

/// Candidates in try-order: an exact flow-identity match first, otherwise a
/// local-address match first, otherwise the published order. The relative
/// order of the remaining entries is always preserved.
fn ranked<'a>(entries: &'a [SocketEntry], preferred: &SipSocket) -> Vec<&'a SocketEntry> {
    let lead = entries
        .iter()
        .position(|e| e.socket.flow_id() == preferred.flow_id())
        .or_else(|| {
            entries
                .iter()
                .position(|e| e.socket.local_addr() == preferred.local_addr())
        });

    match lead {
        Some(lead) => {
            let mut out = Vec::with_capacity(entries.len());
            out.push(&entries[lead]);
            out.extend(
                entries
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != lead)
                    .map(|(_, e)| e),
            );
            out
        }
        None => entries.iter().collect(),
    }
}

/// Parse a destination host literal. A bracketed IPv6 literal has its
/// enclosing brackets stripped before address parsing; a missing closing
/// bracket is a format error.
fn parse_host(host: &str, family: ProtocolFamily) -> Result<IpAddr> {
    let literal = if family == ProtocolFamily::V6 && host.starts_with('[') {
        let inner = &host[1..];
        let end = inner
            .find(']')
            .ok_or_else(|| Error::InvalidAddress(host.to_string()))?;
        &inner[..end]
    } else {
        host
    };
    literal
        .parse()
        .map_err(|_| Error::InvalidAddress(host.to_string()))
}

// The OS rejected the destination as invalid for the socket's bound family
// (EINVAL or EAFNOSUPPORT) — expected when probing a v4-only socket with a
// v6 destination.
fn is_family_mismatch(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::InvalidInput {
        return true;
    }
    #[cfg(unix)]
    const AF_NO_SUPPORT: i32 = 97;
    #[cfg(windows)]
    const AF_NO_SUPPORT: i32 = 10047;
    e.raw_os_error() == Some(AF_NO_SUPPORT)
}
