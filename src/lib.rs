//! UDP transport layer for the siprelay SIP proxy.
//!
//! This crate owns every UDP listening socket of the proxy, for IPv4 and
//! IPv6. Inbound datagrams are classified before any parsing: NAT
//! keepalives are dropped, STUN binding requests are demultiplexed off the
//! SIP port (when enabled) and answered in place, and everything else is
//! handed to the external SIP pipeline asynchronously.
//!
//! The stateful side is a single [`SocketManager`] control loop; the
//! outbound side reads immutable [`SocketRegistry`] snapshots and never
//! touches the manager, so concurrent senders do not serialize against the
//! receive path. Sockets are pinned to flows through [`FlowId`] so replies
//! can reuse the path a request arrived on.
//!
//! Reliable delivery, retransmission and the TCP/TLS transports are out of
//! scope here; one datagram is one message.

pub mod classifier;
pub mod config;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod registry;
pub mod sender;
pub mod socket;
pub mod stun;

pub use config::UdpConfig;
pub use error::{Error, Result};
pub use manager::{ManagerEvent, SocketManager, SocketManagerHandle};
pub use pipeline::SipPipeline;
pub use registry::{SocketEntry, SocketRegistry};
pub use sender::UdpSender;
pub use socket::{FlowId, ManagerId, Origin, ProtocolFamily, SipSocket};
pub use stun::{ChangeMode, StunEnvironment, StunHandler, StunOutcome};

use std::sync::Arc;

use tokio::sync::mpsc;

/// Bind the configured listeners and wire the transport together.
///
/// Returns the manager handle for queries and shutdown, a sender sharing
/// the manager's registry, and the lifecycle event receiver (dropping the
/// receiver is fine when no observer is interested).
pub async fn start_udp_transport(
    config: UdpConfig,
    pipeline: Arc<dyn SipPipeline>,
    stun: Arc<dyn StunHandler>,
) -> Result<(SocketManagerHandle, UdpSender, mpsc::Receiver<ManagerEvent>)> {
    let registry = SocketRegistry::new();
    let (handle, events) = SocketManager::start(config, registry.clone(), pipeline, stun).await?;
    Ok((handle, UdpSender::new(registry), events))
}
