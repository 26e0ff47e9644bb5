use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Bind the announcement listener
///
/// `SO_REUSEADDR` lets several SDK processes on one host observe the same
/// broadcast domain.
pub(crate) fn bind_discovery(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Bind an ephemeral-port socket on `ip` for one lane of a device session
pub(crate) fn bind_lane(ip: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddrV4::new(ip, 0).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// The local IPv4 address the host routes to `device` through
///
/// Connecting a UDP socket performs route selection without sending anything;
/// the handshake advertises this address so the device knows where to answer.
pub(crate) fn route_local_ip(device: SocketAddr) -> io::Result<Ipv4Addr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(device)?;
    match probe.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "IPv6 route to an IPv4 device",
        )),
    }
}
