//! The stateful socket manager.
//!
//! One manager owns every UDP listening socket of the proxy. A single
//! control loop consumes binds, queries, and inbound datagrams from one
//! command channel, so manager state needs no locking. Outbound sends never
//! touch the manager: they run against the registry snapshots it publishes
//! (see [`crate::sender`]).

pub(crate) mod opener;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::classifier::{classify, Classification};
use crate::config::UdpConfig;
use crate::error::{Error, Result};
use crate::pipeline::{Dispatcher, SipPipeline};
use crate::registry::{SocketEntry, SocketRegistry};
use crate::socket::{FlowId, ManagerId, Origin, ProtocolFamily, SipSocket};
use crate::stun::{self, StunHandler};

// Buffer size for receiving datagrams
const RECV_BUFFER_SIZE: usize = 8192;

// How long shutdown waits for each reader task to notice the signal
const READER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle notifications for an optional test/control observer. Dropping
/// the receiver is harmless.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// All configured listeners are bound and the control loop is running.
    Ready { sockets: Vec<SipSocket> },
    /// The control loop has stopped and the registry entries are withdrawn.
    Closed,
}

/// Commands consumed by the control loop.
enum Command {
    Bind {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<SipSocket>>,
    },
    GetSocket {
        family: ProtocolFamily,
        reply: oneshot::Sender<Option<SipSocket>>,
    },
    GetSpecificSocket {
        flow: FlowId,
        reply: oneshot::Sender<Option<SipSocket>>,
    },
    GetRawSocket {
        family: ProtocolFamily,
        reply: oneshot::Sender<Option<Arc<UdpSocket>>>,
    },
    GetSocketList {
        family: ProtocolFamily,
        reply: oneshot::Sender<Vec<SipSocket>>,
    },
    Datagram {
        flow: FlowId,
        payload: Bytes,
        source: SocketAddr,
    },
    Quit,
}

/// Cloneable handle for queries and control operations against a running
/// manager. Every query is bounded by the configured caller-side timeout;
/// an elapsed timeout is surfaced as [`Error::Timeout`] and never retried
/// here.
#[derive(Clone)]
pub struct SocketManagerHandle {
    id: ManagerId,
    tx: mpsc::Sender<Command>,
    query_timeout: Duration,
}

impl SocketManagerHandle {
    /// Identity of the managing task; keys the registry together with a
    /// protocol family.
    pub fn id(&self) -> ManagerId {
        self.id
    }

    /// First-bound socket for the family. Stable policy, no load
    /// balancing; `None` when the family has no listener.
    pub async fn get_socket(&self, family: ProtocolFamily) -> Result<Option<SipSocket>> {
        self.query(|reply| Command::GetSocket { family, reply }).await
    }

    /// Exact flow-identity lookup. `None` is the expected miss outcome
    /// used by outbound flow-reuse logic.
    pub async fn get_specific_socket(&self, flow: FlowId) -> Result<Option<SipSocket>> {
        self.query(|reply| Command::GetSpecificSocket { flow, reply })
            .await
    }

    /// Underlying OS socket of the family's first listener, for read-only
    /// introspection. Callers must not send or receive on it.
    pub async fn get_raw_socket(&self, family: ProtocolFamily) -> Result<Option<Arc<UdpSocket>>> {
        self.query(|reply| Command::GetRawSocket { family, reply })
            .await
    }

    /// Full socket list for the family. The slow, authoritative path; the
    /// per-send hot path reads registry snapshots instead.
    pub async fn get_socket_list(&self, family: ProtocolFamily) -> Result<Vec<SipSocket>> {
        self.query(|reply| Command::GetSocketList { family, reply })
            .await
    }

    /// Bind one more listener at runtime. Unlike the startup binds, a
    /// failure here is returned to the caller and the manager keeps
    /// running.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SipSocket> {
        self.query(|reply| Command::Bind { addr, reply }).await?
    }

    /// Ask the control loop to stop after its current step.
    pub async fn quit(&self) -> Result<()> {
        self.tx.send(Command::Quit).await.map_err(Error::from)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await?;
        match tokio::time::timeout(self.query_timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// The stateful core. Owns the socket lists; reachable only through
/// [`SocketManagerHandle`] and the registry snapshots it publishes.
pub struct SocketManager {
    id: ManagerId,
    config: UdpConfig,
    registry: SocketRegistry,
    dispatcher: Dispatcher,
    stun: Arc<dyn StunHandler>,
    v4: Vec<SocketEntry>,
    v6: Vec<SocketEntry>,
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    events: mpsc::Sender<ManagerEvent>,
    reader_tasks: Vec<JoinHandle<()>>,
}

impl SocketManager {
    /// Bind every configured listener and start the control loop.
    ///
    /// Any bind failure is fatal: the error is returned, no partial
    /// listener set is left running and no manager task is spawned.
    pub async fn start(
        config: UdpConfig,
        registry: SocketRegistry,
        pipeline: Arc<dyn SipPipeline>,
        stun: Arc<dyn StunHandler>,
    ) -> Result<(SocketManagerHandle, mpsc::Receiver<ManagerEvent>)> {
        let id = ManagerId::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(pipeline, config.max_inflight_dispatches);

        let mut manager = SocketManager {
            id,
            registry,
            dispatcher,
            stun,
            v4: Vec::new(),
            v6: Vec::new(),
            cmd_tx: cmd_tx.clone(),
            shutdown_tx,
            events: event_tx,
            reader_tasks: Vec::new(),
            config,
        };

        for addr in bind_plan(&manager.config) {
            manager.open_and_register(addr)?;
        }
        manager.publish();

        let sockets: Vec<SipSocket> = manager
            .v4
            .iter()
            .chain(manager.v6.iter())
            .map(|entry| entry.socket.clone())
            .collect();
        info!("UDP transport ready with {} listener(s)", sockets.len());
        let _ = manager.events.try_send(ManagerEvent::Ready { sockets });

        let handle = SocketManagerHandle {
            id,
            tx: cmd_tx,
            query_timeout: manager.config.query_timeout,
        };
        tokio::spawn(manager.run(cmd_rx));

        Ok((handle, event_rx))
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        debug!("{} control loop started", self.id);
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Bind { addr, reply } => {
                    let result = self.open_and_register(addr);
                    if result.is_ok() {
                        self.publish();
                    }
                    let _ = reply.send(result);
                }
                Command::GetSocket { family, reply } => {
                    let _ = reply.send(self.list(family).first().map(|e| e.socket.clone()));
                }
                Command::GetSpecificSocket { flow, reply } => {
                    let found = self
                        .list(flow.family())
                        .iter()
                        .find(|e| e.socket.flow_id() == flow)
                        .map(|e| e.socket.clone());
                    let _ = reply.send(found);
                }
                Command::GetRawSocket { family, reply } => {
                    let _ = reply.send(self.list(family).first().map(|e| Arc::clone(&e.raw)));
                }
                Command::GetSocketList { family, reply } => {
                    let sockets = self.list(family).iter().map(|e| e.socket.clone()).collect();
                    let _ = reply.send(sockets);
                }
                Command::Datagram {
                    flow,
                    payload,
                    source,
                } => self.handle_datagram(flow, payload, source).await,
                Command::Quit => {
                    info!("{} quitting", self.id);
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    /// Classify one inbound datagram and act on it. Never fails upward:
    /// one malformed or adversarial datagram must not take the listener
    /// down.
    async fn handle_datagram(&self, flow: FlowId, payload: Bytes, source: SocketAddr) {
        let Some(entry) = self
            .list(flow.family())
            .iter()
            .find(|e| e.socket.flow_id() == flow)
        else {
            warn!("datagram from {} on unregistered socket {}, dropping", source, flow);
            return;
        };

        match classify(&payload) {
            Classification::Keepalive => {
                debug!("keepalive from {}, dropping", source);
            }
            Classification::StunCandidate => {
                if self.config.stun_demux {
                    stun::respond(self.stun.as_ref(), entry, source, &payload).await;
                } else {
                    debug!("STUN demuxing disabled, dropping candidate from {}", source);
                }
            }
            Classification::TooShort => {
                debug!(
                    "datagram from {} too short for SIP ({} bytes), dropping",
                    source,
                    payload.len()
                );
            }
            Classification::Sip => {
                let origin = Origin {
                    family: entry.socket.family(),
                    source,
                    raw_socket: Arc::clone(&entry.raw),
                    socket: entry.socket.clone(),
                };
                self.dispatcher.dispatch(payload, origin);
            }
        }
    }

    fn open_and_register(&mut self, addr: SocketAddr) -> Result<SipSocket> {
        let socket = opener::open_listener(addr, self.config.ipv6_recv_buffer)
            .map_err(|e| Error::BindFailed(addr, e))?;
        let local_addr = socket.local_addr().map_err(Error::LocalAddrFailed)?;
        let family = ProtocolFamily::of(&local_addr);
        let sip_socket = SipSocket::new(family, self.id, local_addr);
        let entry = SocketEntry {
            raw: Arc::new(socket),
            socket: sip_socket.clone(),
        };
        info!("SIP UDP listener bound to {}", local_addr);
        self.spawn_reader(entry.clone());
        self.list_mut(family).push(entry);
        Ok(sip_socket)
    }

    /// One reader per OS socket: datagrams are funneled into the command
    /// channel so the control loop sees them strictly in sequence with
    /// queries and binds.
    fn spawn_reader(&mut self, entry: SocketEntry) {
        let tx = self.cmd_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let flow = entry.socket.flow_id();

        let handle = tokio::spawn(async move {
            loop {
                let mut buffer = BytesMut::with_capacity(RECV_BUFFER_SIZE);
                buffer.resize(RECV_BUFFER_SIZE, 0);

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("reader for {} stopping", flow);
                            break;
                        }
                    }
                    result = entry.raw.recv_from(&mut buffer) => match result {
                        Ok((len, source)) => {
                            buffer.truncate(len);
                            trace!("received {} bytes from {}", len, source);
                            let datagram = Command::Datagram {
                                flow,
                                payload: buffer.freeze(),
                                source,
                            };
                            if tx.send(datagram).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("receive error on {}: {}", flow, e);
                        }
                    },
                }
            }
        });
        self.reader_tasks.push(handle);
    }

    fn publish(&self) {
        for (family, list) in [(ProtocolFamily::V4, &self.v4), (ProtocolFamily::V6, &self.v6)] {
            if !list.is_empty() {
                self.registry.publish(self.id, family, list.clone());
            }
        }
    }

    fn list(&self, family: ProtocolFamily) -> &[SocketEntry] {
        match family {
            ProtocolFamily::V4 => &self.v4,
            ProtocolFamily::V6 => &self.v6,
        }
    }

    fn list_mut(&mut self, family: ProtocolFamily) -> &mut Vec<SocketEntry> {
        match family {
            ProtocolFamily::V4 => &mut self.v4,
            ProtocolFamily::V6 => &mut self.v6,
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.reader_tasks.drain(..) {
            let _ = tokio::time::timeout(READER_SHUTDOWN_TIMEOUT, handle).await;
        }
        self.registry.remove_owner(self.id);
        let _ = self.events.try_send(ManagerEvent::Closed);
        info!("{} closed", self.id);
    }
}

/// Bind requests derived from the configured interfaces: every IPv4
/// address plus loopback, and a single v6-only wildcard listener when IPv6
/// is enabled.
fn bind_plan(config: &UdpConfig) -> Vec<SocketAddr> {
    let mut plan: Vec<SocketAddr> = Vec::new();
    for ip in config.local_addrs.iter().copied().filter(IpAddr::is_ipv4) {
        let addr = SocketAddr::new(ip, config.listen_port);
        if !plan.contains(&addr) {
            plan.push(addr);
        }
    }
    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.listen_port);
    if !plan.contains(&loopback) {
        plan.push(loopback);
    }
    if config.ipv6_enabled {
        plan.push(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            config.listen_port,
        ));
    }
    plan
}
