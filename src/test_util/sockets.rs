use std::io;
use std::net::SocketAddr;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};

use crate::config::SocketOptions;
use crate::connector::sockets::{ReuseAddrSockets, SocketProvider};
use crate::messaging::endpoint_addr::AddressFamily;

fn plain_tcp_socket(family: AddressFamily) -> io::Result<TcpSocket> {
    match family {
        AddressFamily::V4 => TcpSocket::new_v4(),
        AddressFamily::V6 => TcpSocket::new_v6(),
    }
}

/// Binds P2P sockets and listeners to ephemeral ports on the requested IP instead of sharing the
///  control connection's port. This keeps tests independent of the platform's address reuse
///  semantics, and lets them find the listener.
#[derive(Default)]
pub struct EphemeralSockets {
    listeners: Mutex<Vec<SocketAddr>>,
}
impl EphemeralSockets {
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.lock().clone()
    }
}

impl SocketProvider for EphemeralSockets {
    fn tcp_socket(&self, family: AddressFamily, _options: &SocketOptions) -> io::Result<TcpSocket> {
        plain_tcp_socket(family)
    }

    fn bind_tcp(&self, local: SocketAddr, _options: &SocketOptions) -> io::Result<TcpSocket> {
        let socket = plain_tcp_socket(AddressFamily::of(&local.ip()))?;
        socket.bind(SocketAddr::new(local.ip(), 0))?;
        Ok(socket)
    }

    fn bind_listener(&self, local: SocketAddr, options: &SocketOptions, backlog: u32) -> io::Result<TcpListener> {
        let listener = self.bind_tcp(local, options)?
            .listen(backlog)?;
        self.listeners.lock().push(listener.local_addr()?);
        Ok(listener)
    }

    fn bind_udp(&self, local: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket> {
        ReuseAddrSockets.bind_udp(local, options)
    }
}

/// Simulates a platform that does not allow several sockets on the same local address
pub struct NoReuseSockets;

impl SocketProvider for NoReuseSockets {
    fn tcp_socket(&self, family: AddressFamily, _options: &SocketOptions) -> io::Result<TcpSocket> {
        plain_tcp_socket(family)
    }

    fn bind_tcp(&self, _local: SocketAddr, _options: &SocketOptions) -> io::Result<TcpSocket> {
        Err(io::Error::new(io::ErrorKind::AddrInUse, "address reuse is not supported"))
    }

    fn bind_listener(&self, _local: SocketAddr, _options: &SocketOptions, _backlog: u32) -> io::Result<TcpListener> {
        Err(io::Error::new(io::ErrorKind::AddrInUse, "address reuse is not supported"))
    }

    fn bind_udp(&self, local: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket> {
        ReuseAddrSockets.bind_udp(local, options)
    }
}
