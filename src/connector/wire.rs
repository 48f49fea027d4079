//! Messages on a connection attempt's control channel, and the raw datagrams / headers on its
//!  data sockets.

use std::net::SocketAddr;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::connector::auth::SecretPair;
use crate::connector::Role;
use crate::messaging::endpoint_addr::{AddressFamily, ConnectionId, EndpointId, IpEncoding};
use crate::messaging::session_messages::AUTH_KEY_LEN;
use crate::util::buf::{ensure_consumed, try_get_array};

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectorTag {
    ClientP2P = 1,
    ServiceP2P = 2,
    ClientProxy = 3,
    ServiceProxy = 4,
    AuthKey = 5,
    AuthHash = 6,
    CreateP2PConnection = 7,
    CreateP2PConnectionInDualMode = 8,
    CreateProxyConnection = 9,
    P2PFailed = 10,
    Error = 11,
    ClientEndpoint = 12,
    ServiceEndpoint = 13,
    P2PHolePunched = 14,
    P2PLocalHolePunched = 15,
    P2PConnectionCreated = 16,
    ProxyConnectionCreated = 17,
}

/// Messages a connection attempt sends to the rendezvous server
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttemptMessage {
    /// TCP: this endpoint wants a P2P connection, and this is its local address
    P2P { role: Role, connection_id: ConnectionId, local: SocketAddr },
    /// TCP: this endpoint can not do P2P and wants a relayed connection right away
    Proxy { role: Role, connection_id: ConnectionId },
    /// UDP: registers the control channel for a connection
    Endpoint { role: Role, connection_id: ConnectionId },
    AuthHash { hash: [u8; AUTH_KEY_LEN], key: [u8; AUTH_KEY_LEN] },
    P2PFailed,
    P2PHolePunched,
    P2PLocalHolePunched,
    P2PConnectionCreated,
    /// UDP: hole punching failed, relay datagrams through the server instead
    CreateProxyConnection,
}

impl AttemptMessage {
    pub fn encode(&self, family: AddressFamily) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            AttemptMessage::P2P { role, connection_id, local } => {
                buf.put_u8(match role {
                    Role::Client => ConnectorTag::ClientP2P,
                    Role::Service => ConnectorTag::ServiceP2P,
                }.into());
                connection_id.ser(&mut buf);
                family.put_endpoint(&mut buf, *local, IpEncoding::Inverted)?;
            }
            AttemptMessage::Proxy { role, connection_id } => {
                buf.put_u8(match role {
                    Role::Client => ConnectorTag::ClientProxy,
                    Role::Service => ConnectorTag::ServiceProxy,
                }.into());
                connection_id.ser(&mut buf);
            }
            AttemptMessage::Endpoint { role, connection_id } => {
                buf.put_u8(match role {
                    Role::Client => ConnectorTag::ClientEndpoint,
                    Role::Service => ConnectorTag::ServiceEndpoint,
                }.into());
                connection_id.ser(&mut buf);
            }
            AttemptMessage::AuthHash { hash, key } => {
                buf.put_u8(ConnectorTag::AuthHash.into());
                buf.put_slice(hash);
                buf.put_slice(key);
            }
            AttemptMessage::P2PFailed => buf.put_u8(ConnectorTag::P2PFailed.into()),
            AttemptMessage::P2PHolePunched => buf.put_u8(ConnectorTag::P2PHolePunched.into()),
            AttemptMessage::P2PLocalHolePunched => buf.put_u8(ConnectorTag::P2PLocalHolePunched.into()),
            AttemptMessage::P2PConnectionCreated => buf.put_u8(ConnectorTag::P2PConnectionCreated.into()),
            AttemptMessage::CreateProxyConnection => buf.put_u8(ConnectorTag::CreateProxyConnection.into()),
        }
        Ok(buf.freeze())
    }

    #[cfg(test)]
    pub fn tag(raw: &[u8]) -> Option<ConnectorTag> {
        raw.first()
            .and_then(|&t| ConnectorTag::try_from(t).ok())
    }
}

/// Messages the rendezvous server sends to a TCP connection attempt
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TcpServerMessage {
    AuthKey([u8; AUTH_KEY_LEN]),
    CreateP2PConnection { peer_public: SocketAddr, peer_private: Option<SocketAddr>, secrets: SecretPair },
    CreateProxyConnection { relay_port: u16 },
    Error,
}

impl TcpServerMessage {
    pub fn decode(mut buf: &[u8], family: AddressFamily) -> anyhow::Result<TcpServerMessage> {
        let buf = &mut buf;
        let message = match try_get_tag(buf)? {
            ConnectorTag::AuthKey => TcpServerMessage::AuthKey(try_get_array(buf)?),
            tag @ (ConnectorTag::CreateP2PConnection | ConnectorTag::CreateP2PConnectionInDualMode) => {
                let peer_public = family.try_get_endpoint(buf, IpEncoding::Plain)?;
                let secrets = SecretPair {
                    own: try_get_array(buf)?,
                    expected: try_get_array(buf)?,
                };
                let peer_private = if tag == ConnectorTag::CreateP2PConnectionInDualMode {
                    Some(family.try_get_endpoint(buf, IpEncoding::Inverted)?)
                }
                else {
                    None
                };
                TcpServerMessage::CreateP2PConnection { peer_public, peer_private, secrets }
            }
            ConnectorTag::CreateProxyConnection => {
                let port = buf.try_get_i32()?;
                let relay_port = u16::try_from(port)
                    .map_err(|_| anyhow!("relay port {} out of range", port))?;
                TcpServerMessage::CreateProxyConnection { relay_port }
            }
            ConnectorTag::Error => TcpServerMessage::Error,
            tag => bail!("unexpected message {:?} on a TCP connection attempt", tag),
        };
        ensure_consumed(&*buf)?;
        Ok(message)
    }

    #[cfg(test)]
    pub fn encode(&self, family: AddressFamily) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            TcpServerMessage::AuthKey(key) => {
                buf.put_u8(ConnectorTag::AuthKey.into());
                buf.put_slice(key);
            }
            TcpServerMessage::CreateP2PConnection { peer_public, peer_private, secrets } => {
                buf.put_u8(if peer_private.is_some() { ConnectorTag::CreateP2PConnectionInDualMode } else { ConnectorTag::CreateP2PConnection }.into());
                family.put_endpoint(&mut buf, *peer_public, IpEncoding::Plain).unwrap();
                buf.put_slice(&secrets.own);
                buf.put_slice(&secrets.expected);
                if let Some(private) = peer_private {
                    family.put_endpoint(&mut buf, *private, IpEncoding::Inverted).unwrap();
                }
            }
            TcpServerMessage::CreateProxyConnection { relay_port } => {
                buf.put_u8(ConnectorTag::CreateProxyConnection.into());
                buf.put_i32(*relay_port as i32);
            }
            TcpServerMessage::Error => buf.put_u8(ConnectorTag::Error.into()),
        }
        buf.freeze()
    }
}

/// Messages the rendezvous server sends to a UDP connection attempt
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UdpServerMessage {
    AuthKey { key: [u8; AUTH_KEY_LEN], endpoint_id: EndpointId },
    CreateP2PConnection { peer_public: SocketAddr, peer_private: Option<SocketAddr>, peer_endpoint_id: EndpointId },
    /// the peer received our hole punch datagram on its public (or private) endpoint
    P2PHolePunched,
    P2PConnectionCreated,
    ProxyConnectionCreated,
    Error,
}

impl UdpServerMessage {
    pub fn decode(mut buf: &[u8], family: AddressFamily) -> anyhow::Result<UdpServerMessage> {
        let buf = &mut buf;
        let message = match try_get_tag(buf)? {
            ConnectorTag::AuthKey => UdpServerMessage::AuthKey {
                key: try_get_array(buf)?,
                endpoint_id: EndpointId::try_deser(buf)?,
            },
            ConnectorTag::CreateP2PConnection => UdpServerMessage::CreateP2PConnection {
                peer_public: family.try_get_endpoint(buf, IpEncoding::Plain)?,
                peer_private: None,
                peer_endpoint_id: EndpointId::try_deser(buf)?,
            },
            ConnectorTag::CreateP2PConnectionInDualMode => UdpServerMessage::CreateP2PConnection {
                peer_public: family.try_get_endpoint(buf, IpEncoding::Plain)?,
                peer_private: Some(family.try_get_endpoint(buf, IpEncoding::Inverted)?),
                peer_endpoint_id: EndpointId::try_deser(buf)?,
            },
            ConnectorTag::P2PHolePunched | ConnectorTag::P2PLocalHolePunched => UdpServerMessage::P2PHolePunched,
            ConnectorTag::P2PConnectionCreated => UdpServerMessage::P2PConnectionCreated,
            ConnectorTag::ProxyConnectionCreated => UdpServerMessage::ProxyConnectionCreated,
            ConnectorTag::Error => UdpServerMessage::Error,
            tag => bail!("unexpected message {:?} on a UDP connection attempt", tag),
        };
        ensure_consumed(&*buf)?;
        Ok(message)
    }

    #[cfg(test)]
    pub fn encode(&self, family: AddressFamily) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            UdpServerMessage::AuthKey { key, endpoint_id } => {
                buf.put_u8(ConnectorTag::AuthKey.into());
                buf.put_slice(key);
                endpoint_id.ser(&mut buf);
            }
            UdpServerMessage::CreateP2PConnection { peer_public, peer_private, peer_endpoint_id } => {
                buf.put_u8(if peer_private.is_some() { ConnectorTag::CreateP2PConnectionInDualMode } else { ConnectorTag::CreateP2PConnection }.into());
                family.put_endpoint(&mut buf, *peer_public, IpEncoding::Plain).unwrap();
                if let Some(private) = peer_private {
                    family.put_endpoint(&mut buf, *private, IpEncoding::Inverted).unwrap();
                }
                peer_endpoint_id.ser(&mut buf);
            }
            UdpServerMessage::P2PHolePunched => buf.put_u8(ConnectorTag::P2PHolePunched.into()),
            UdpServerMessage::P2PConnectionCreated => buf.put_u8(ConnectorTag::P2PConnectionCreated.into()),
            UdpServerMessage::ProxyConnectionCreated => buf.put_u8(ConnectorTag::ProxyConnectionCreated.into()),
            UdpServerMessage::Error => buf.put_u8(ConnectorTag::Error.into()),
        }
        buf.freeze()
    }
}

fn try_get_tag(buf: &mut impl Buf) -> anyhow::Result<ConnectorTag> {
    let raw = buf.try_get_u8()?;
    ConnectorTag::try_from(raw)
        .map_err(|_| anyhow!("unknown control message tag {}", raw))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DatagramTag {
    EndpointInfo = 1,
    P2PHolePunch = 2,
    P2PLocalHolePunch = 3,
}

pub const HOLE_PUNCH_LEN: usize = 1 + EndpointId::SERIALIZED_LEN;

/// Announces a UDP endpoint's local address to the rendezvous server, which learns the
///  endpoint's translated public address from the datagram's source
pub fn endpoint_info(endpoint_id: &EndpointId, local: SocketAddr) -> anyhow::Result<Bytes> {
    let family = AddressFamily::of(&local.ip());

    let mut buf = BytesMut::with_capacity(1 + EndpointId::SERIALIZED_LEN + family.endpoint_len());
    buf.put_u8(DatagramTag::EndpointInfo.into());
    endpoint_id.ser(&mut buf);
    family.put_endpoint(&mut buf, local, IpEncoding::Inverted)?;
    Ok(buf.freeze())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PunchTarget {
    Public,
    Private,
}

pub fn hole_punch(target: PunchTarget, own_endpoint_id: &EndpointId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HOLE_PUNCH_LEN);
    buf.put_u8(match target {
        PunchTarget::Public => DatagramTag::P2PHolePunch,
        PunchTarget::Private => DatagramTag::P2PLocalHolePunch,
    }.into());
    own_endpoint_id.ser(&mut buf);
    buf.freeze()
}

/// Returns `None` for anything that is not a well-formed hole punch datagram
pub fn parse_hole_punch(raw: &[u8]) -> Option<(PunchTarget, EndpointId)> {
    if raw.len() != HOLE_PUNCH_LEN {
        return None;
    }
    let target = match DatagramTag::try_from(raw[0]).ok()? {
        DatagramTag::P2PHolePunch => PunchTarget::Public,
        DatagramTag::P2PLocalHolePunch => PunchTarget::Private,
        DatagramTag::EndpointInfo => return None,
    };
    let mut id = [0u8; 16];
    id.copy_from_slice(&raw[1..]);
    Some((target, EndpointId(id)))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProxyEndpointTag {
    ClientProxyEndpoint = 1,
    ServiceProxyEndpoint = 2,
}

pub const PROXY_HEADER_LEN: usize = 1 + ConnectionId::SERIALIZED_LEN;

/// Identifies a relayed connection to the rendezvous server. The server echoes the header once
///  the relay is ready.
pub fn proxy_header(role: Role, connection_id: &ConnectionId) -> [u8; PROXY_HEADER_LEN] {
    let mut result = [0u8; PROXY_HEADER_LEN];
    result[0] = match role {
        Role::Client => ProxyEndpointTag::ClientProxyEndpoint,
        Role::Service => ProxyEndpointTag::ServiceProxyEndpoint,
    }.into();
    result[1..].copy_from_slice(&connection_id.0);
    result
}
