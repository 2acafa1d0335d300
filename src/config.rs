use std::net::IpAddr;
use std::time::Duration;

/// Configuration consumed by the UDP transport.
///
/// Produced by the proxy's configuration layer; only the effect matters
/// here. Listeners are derived from `local_addrs` (IPv4 entries, plus
/// loopback) and `ipv6_enabled`.
#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// SIP listening port used for every bound address.
    pub listen_port: u16,
    /// Local addresses to listen on. Each IPv4 entry gets its own socket;
    /// loopback is appended automatically.
    pub local_addrs: Vec<IpAddr>,
    /// Whether to open the v6-only wildcard listener.
    pub ipv6_enabled: bool,
    /// Whether STUN demultiplexing on SIP ports is enabled.
    pub stun_demux: bool,
    /// Capacity of the manager command channel.
    pub channel_capacity: usize,
    /// Maximum concurrently running pipeline dispatches before the
    /// transport starts shedding inbound SIP datagrams.
    pub max_inflight_dispatches: usize,
    /// Caller-side timeout applied to every manager query.
    pub query_timeout: Duration,
    /// Receive buffer requested for the IPv6 listener; 0 keeps the OS
    /// default.
    pub ipv6_recv_buffer: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            listen_port: 5060,
            local_addrs: Vec::new(),
            ipv6_enabled: false,
            stun_demux: false,
            channel_capacity: 1000,
            max_inflight_dispatches: 1024,
            query_timeout: Duration::from_millis(1500),
            ipv6_recv_buffer: 1024 * 1024,
        }
    }
}
