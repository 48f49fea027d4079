pub mod auth;
pub mod sockets;
pub mod tcp_connector;
pub mod udp_connector;
pub mod wire;

use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::SocketOptions;
use crate::messaging::endpoint_addr::ConnectionId;
use crate::messaging::session_messages::AUTH_KEY_LEN;

/// Which side of a connection an attempt is working for. Both sides run the same state machine,
///  but identify themselves differently to the rendezvous server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Client,
    Service,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionMode {
    P2P,
    Proxy,
}

/// The lifecycle of a connection attempt:
///
/// ```ascii
/// Initial -> P2PMode -> P2PHandshake -> Completed
///                 \            \
///                  +-> ProxyMode -> ProxyHandshake -> Completed
/// ```
///
/// UDP attempts skip `P2PMode` and `ProxyMode`. `Completed` is terminal, and whoever moves an
///  attempt there is responsible for freeing its resources and reporting its outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectorState {
    Initial,
    P2PMode,
    P2PHandshake,
    ProxyMode,
    ProxyHandshake,
    Completed,
}

/// Everything a connection attempt reports to its owner. An attempt reports at most one of
///  `Connected` and `Failed`, and nothing after that.
#[derive(Debug)]
pub enum ConnectorEvent<C> {
    AuthKey([u8; AUTH_KEY_LEN]),
    Connected { connection: C, mode: ConnectionMode },
    Failed(anyhow::Error),
}

pub type ConnectorEvents<C> = mpsc::UnboundedSender<ConnectorEvent<C>>;

/// Routing data the rendezvous server assigned to a connection attempt
#[derive(Clone, Debug)]
pub struct ConnectorArgs {
    pub role: Role,
    pub connection_id: ConnectionId,
    pub server_ip: IpAddr,
    pub options: SocketOptions,
}

/// The owner's handle to a running connection attempt
pub trait ConnectorHandle: Send + Sync + 'static {
    /// Terminates the attempt, closing all its sockets without reporting an outcome. This is a
    ///  no-op for attempts that completed already.
    fn abort(&self);

    /// Relays an application level authentication hash to the rendezvous server
    fn on_authentication_hash(&self, hash: [u8; AUTH_KEY_LEN], key: [u8; AUTH_KEY_LEN]);
}

pub trait ConnectorFactory<C>: Send + Sync + 'static {
    fn start(&self, args: ConnectorArgs, events: ConnectorEvents<C>) -> Arc<dyn ConnectorHandle>;
}
