use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;

use crate::socket::{ManagerId, ProtocolFamily, SipSocket};

/// One bound socket as seen by senders: the OS socket plus its logical
/// handle. Entries are appended at bind time and never removed during
/// normal operation.
#[derive(Debug, Clone)]
pub struct SocketEntry {
    pub raw: Arc<UdpSocket>,
    pub socket: SipSocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RegistryKey {
    owner: ManagerId,
    family: ProtocolFamily,
}

/// Concurrently-readable socket registry.
///
/// The manager publishes an immutable snapshot per `(owner, family)` key on
/// every lifecycle change. Senders clone the snapshot `Arc` and work
/// against it without ever contending with the control loop; a reader may
/// observe a stale-but-valid snapshot, never a torn one.
#[derive(Debug, Clone, Default)]
pub struct SocketRegistry {
    inner: Arc<DashMap<RegistryKey, Arc<[SocketEntry]>>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for `(owner, family)`.
    pub(crate) fn publish(
        &self,
        owner: ManagerId,
        family: ProtocolFamily,
        entries: Vec<SocketEntry>,
    ) {
        self.inner.insert(RegistryKey { owner, family }, entries.into());
    }

    /// Current snapshot for `(owner, family)`, if one was published.
    pub fn snapshot(
        &self,
        owner: ManagerId,
        family: ProtocolFamily,
    ) -> Option<Arc<[SocketEntry]>> {
        self.inner
            .get(&RegistryKey { owner, family })
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Withdraw every snapshot owned by a manager (shutdown path).
    pub(crate) fn remove_owner(&self, owner: ManagerId) {
        self.inner.retain(|key, _| key.owner != owner);
    }
}
