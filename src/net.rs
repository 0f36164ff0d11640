//! Socket construction
//!
//! All sockets are created through socket2 so the options the protocol needs
//! (address reuse for the shared discovery port, SO_BROADCAST for offers) are
//! set before bind, then handed to tokio.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

use crate::error::TransferError;

pub const UNSPECIFIED_V4: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Wildcard address of the same family as `peer`
pub fn unspecified_for(peer: &SocketAddr) -> IpAddr {
    if peer.is_ipv4() {
        UNSPECIFIED_V4
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Create a TCP listener bound to `addr`
pub async fn create_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1024)?;

    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    info!("Listening on TCP {}", listener.local_addr()?);
    Ok(listener)
}

/// Create a UDP socket bound to `addr`.
///
/// `shared` enables SO_REUSEADDR (and SO_REUSEPORT on unix) so several
/// listeners on one host can receive the same broadcast offers.
pub async fn create_udp_socket(addr: SocketAddr, shared: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;

    if shared {
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
    }

    socket.bind(&SockAddr::from(addr))?;

    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    let udp = UdpSocket::from_std(std_socket)?;

    debug!("UDP socket bound to {}", udp.local_addr()?);
    Ok(udp)
}

/// Ask for a larger kernel receive buffer; failure is logged and ignored
pub fn set_recv_buffer(socket: &UdpSocket, size: usize) {
    if let Err(e) = SockRef::from(socket).set_recv_buffer_size(size) {
        debug!("Failed to set SO_RCVBUF to {}: {}", size, e);
    }
}

/// Create an unbound-port UDP socket allowed to send to broadcast addresses
pub async fn create_broadcast_socket(bind_ip: IpAddr) -> io::Result<UdpSocket> {
    let socket = create_udp_socket(SocketAddr::new(bind_ip, 0), false).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Connect to `addr`, giving up after `timeout`
pub async fn connect_tcp(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransferError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            debug!("Connected to {}", addr);
            Ok(stream)
        }
        Ok(Err(source)) => Err(TransferError::Connect { addr, source }),
        Err(_) => Err(TransferError::ConnectTimeout { addr, timeout }),
    }
}
