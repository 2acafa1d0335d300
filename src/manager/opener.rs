//! Bind-time socket construction.
//!
//! Listening sockets are built through `socket2` so that address reuse and
//! the IPv6-only flag are set before the bind, then handed to tokio.

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

/// Open one listening socket for the manager.
///
/// IPv6 listeners are forced into v6-only mode (the IPv4 listeners own the
/// v4 traffic) and get an oversized receive buffer when one is configured.
pub(crate) fn open_listener(addr: SocketAddr, ipv6_recv_buffer: usize) -> io::Result<UdpSocket> {
    let socket = dgram_socket(addr)?;
    if addr.is_ipv6() && ipv6_recv_buffer > 0 {
        socket.set_recv_buffer_size(ipv6_recv_buffer)?;
    }
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Reply-only socket for a single STUN transaction: same options as a
/// listener, bound to the same local address on an OS-assigned port, minus
/// the receive-buffer tuning.
pub(crate) fn open_ephemeral(local_ip: IpAddr) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(local_ip, 0);
    let socket = dgram_socket(addr)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn dgram_socket(addr: SocketAddr) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    {
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;

    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    Ok(socket)
}
