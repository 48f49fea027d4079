use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};

use crate::config::SocketOptions;
use crate::messaging::endpoint_addr::AddressFamily;

/// Creates the sockets of connection attempts. P2P sockets and listeners are bound to the local
///  address of the attempt's control connection so that they share its NAT mapping, which
///  requires address reuse support from the platform.
pub trait SocketProvider: Send + Sync + 'static {
    /// An unbound TCP socket with address reuse enabled
    fn tcp_socket(&self, family: AddressFamily, options: &SocketOptions) -> io::Result<TcpSocket>;

    /// A TCP socket bound to `local`, which is typically in use by another socket already
    fn bind_tcp(&self, local: SocketAddr, options: &SocketOptions) -> io::Result<TcpSocket>;

    fn bind_listener(&self, local: SocketAddr, options: &SocketOptions, backlog: u32) -> io::Result<TcpListener>;

    fn bind_udp(&self, local: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket>;
}

pub struct ReuseAddrSockets;

impl SocketProvider for ReuseAddrSockets {
    fn tcp_socket(&self, family: AddressFamily, options: &SocketOptions) -> io::Result<TcpSocket> {
        let socket = match family {
            AddressFamily::V4 => TcpSocket::new_v4()?,
            AddressFamily::V6 => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuseport(true)?;

        if let Some(size) = options.effective_receive_buffer_size() {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = options.effective_send_buffer_size() {
            socket.set_send_buffer_size(size)?;
        }
        Ok(socket)
    }

    fn bind_tcp(&self, local: SocketAddr, options: &SocketOptions) -> io::Result<TcpSocket> {
        let socket = self.tcp_socket(AddressFamily::of(&local.ip()), options)?;
        socket.bind(local)?;
        Ok(socket)
    }

    fn bind_listener(&self, local: SocketAddr, options: &SocketOptions, backlog: u32) -> io::Result<TcpListener> {
        self.bind_tcp(local, options)?
            .listen(backlog)
    }

    fn bind_udp(&self, local: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(size) = options.effective_receive_buffer_size() {
            socket.set_recv_buffer_size(size as usize)?;
        }
        if let Some(size) = options.effective_send_buffer_size() {
            socket.set_send_buffer_size(size as usize)?;
        }
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }
}

/// Counts the sockets a connection attempt currently holds. Every socket travels together with
///  a [SocketGuard], so the count drops when the socket's owner drops it.
#[derive(Clone, Default, Debug)]
pub struct SocketGauge {
    open: Arc<AtomicUsize>,
}
impl SocketGauge {
    pub fn track(&self) -> SocketGuard {
        self.open.fetch_add(1, Ordering::AcqRel);
        SocketGuard { open: self.open.clone() }
    }

    pub fn open_sockets(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct SocketGuard {
    open: Arc<AtomicUsize>,
}
impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A socket owned by a connection attempt
pub struct Tracked<T> {
    pub socket: T,
    pub guard: SocketGuard,
}
