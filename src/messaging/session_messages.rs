use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::messaging::endpoint_addr::ConnectionId;
use crate::util::buf::{ensure_consumed, put_bytes, put_optional_bytes, put_string, try_get_array, try_get_bytes, try_get_optional_bytes, try_get_string};

pub type RequestId = Uuid;

pub const AUTH_KEY_LEN: usize = 20;
pub const MAX_SESSION_TAG_LEN: usize = 64;

/// Session messages are addressed to a module on the receiving side
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ModuleId {
    ClientTcp = 10,
    ClientUdp = 11,
    ClientRpc = 12,
    ServiceTcp = 20,
    ServiceUdp = 21,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum SessionTag {
    Request = 1,
    RpcRequest = 2,
    RzvData = 3,
    ConnectionAccepted = 4,
    RequestError = 5,
    AuthKey = 6,
    AuthHash = 7,
    AuthError = 8,
    RpcResult = 9,
    SoftnetError = 10,
    AppError = 11,
    IncomingRequest = 12,
    RequestOk = 13,
    ServiceRzvData = 14,
    ServiceAuthKey = 15,
    ServiceAuthHash = 16,
    ServiceAuthError = 17,
}

/// Messages exchanged with the rendezvous server over the session channel.
///
/// The first group is used by the client side controllers, the second by service side port
///  bindings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionMessage {
    Request { request_id: RequestId, service_id: i64, virtual_port: i32, session_tag: Option<Bytes> },
    RpcRequest { request_id: RequestId, service_id: i64, procedure: String, args: Bytes, session_tag: Option<Bytes> },
    RzvData { request_id: RequestId, connection_id: ConnectionId, server_id: i32, server_ip: IpAddr },
    ConnectionAccepted { request_id: RequestId },
    RequestError { request_id: RequestId, code: i32 },
    AuthKey { request_id: RequestId, server_id: i32, key: [u8; AUTH_KEY_LEN] },
    AuthHash { request_id: RequestId, hash: [u8; AUTH_KEY_LEN], key: [u8; AUTH_KEY_LEN] },
    AuthError { request_id: RequestId },
    RpcResult { request_id: RequestId, result: Bytes },
    SoftnetError { request_id: RequestId, code: i32 },
    AppError { request_id: RequestId, code: i32, payload: Bytes },

    IncomingRequest { request_id: RequestId, client_id: i64, virtual_port: i32, session_tag: Option<Bytes> },
    RequestOk { request_id: RequestId, virtual_port: i32 },
    ServiceRzvData { request_id: RequestId, virtual_port: i32, connection_id: ConnectionId, server_id: i32, server_ip: IpAddr },
    ServiceAuthKey { virtual_port: i32, connection_id: ConnectionId, server_id: i32, key: [u8; AUTH_KEY_LEN] },
    ServiceAuthHash { virtual_port: i32, connection_id: ConnectionId, hash: [u8; AUTH_KEY_LEN], key: [u8; AUTH_KEY_LEN] },
    ServiceAuthError { virtual_port: i32, connection_id: ConnectionId },
}

impl SessionMessage {
    fn tag(&self) -> SessionTag {
        match self {
            SessionMessage::Request { .. } => SessionTag::Request,
            SessionMessage::RpcRequest { .. } => SessionTag::RpcRequest,
            SessionMessage::RzvData { .. } => SessionTag::RzvData,
            SessionMessage::ConnectionAccepted { .. } => SessionTag::ConnectionAccepted,
            SessionMessage::RequestError { .. } => SessionTag::RequestError,
            SessionMessage::AuthKey { .. } => SessionTag::AuthKey,
            SessionMessage::AuthHash { .. } => SessionTag::AuthHash,
            SessionMessage::AuthError { .. } => SessionTag::AuthError,
            SessionMessage::RpcResult { .. } => SessionTag::RpcResult,
            SessionMessage::SoftnetError { .. } => SessionTag::SoftnetError,
            SessionMessage::AppError { .. } => SessionTag::AppError,
            SessionMessage::IncomingRequest { .. } => SessionTag::IncomingRequest,
            SessionMessage::RequestOk { .. } => SessionTag::RequestOk,
            SessionMessage::ServiceRzvData { .. } => SessionTag::ServiceRzvData,
            SessionMessage::ServiceAuthKey { .. } => SessionTag::ServiceAuthKey,
            SessionMessage::ServiceAuthHash { .. } => SessionTag::ServiceAuthHash,
            SessionMessage::ServiceAuthError { .. } => SessionTag::ServiceAuthError,
        }
    }

    pub fn encode(&self, module: ModuleId) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(module.into());
        buf.put_u8(self.tag().into());
        self.ser_fields(&mut buf);
        buf.freeze()
    }

    fn ser_fields(&self, buf: &mut impl BufMut) {
        match self {
            SessionMessage::Request { request_id, service_id, virtual_port, session_tag } => {
                put_request_id(buf, request_id);
                buf.put_i64(*service_id);
                buf.put_i32(*virtual_port);
                put_optional_bytes(buf, session_tag.as_deref());
            }
            SessionMessage::RpcRequest { request_id, service_id, procedure, args, session_tag } => {
                put_request_id(buf, request_id);
                buf.put_i64(*service_id);
                put_string(buf, procedure);
                put_bytes(buf, args);
                put_optional_bytes(buf, session_tag.as_deref());
            }
            SessionMessage::RzvData { request_id, connection_id, server_id, server_ip } => {
                put_request_id(buf, request_id);
                connection_id.ser(buf);
                buf.put_i32(*server_id);
                put_ip(buf, server_ip);
            }
            SessionMessage::ConnectionAccepted { request_id } |
            SessionMessage::AuthError { request_id } => {
                put_request_id(buf, request_id);
            }
            SessionMessage::RequestError { request_id, code } |
            SessionMessage::SoftnetError { request_id, code } => {
                put_request_id(buf, request_id);
                buf.put_i32(*code);
            }
            SessionMessage::AuthKey { request_id, server_id, key } => {
                put_request_id(buf, request_id);
                buf.put_i32(*server_id);
                buf.put_slice(key);
            }
            SessionMessage::AuthHash { request_id, hash, key } => {
                put_request_id(buf, request_id);
                buf.put_slice(hash);
                buf.put_slice(key);
            }
            SessionMessage::RpcResult { request_id, result } => {
                put_request_id(buf, request_id);
                put_bytes(buf, result);
            }
            SessionMessage::AppError { request_id, code, payload } => {
                put_request_id(buf, request_id);
                buf.put_i32(*code);
                put_bytes(buf, payload);
            }
            SessionMessage::IncomingRequest { request_id, client_id, virtual_port, session_tag } => {
                put_request_id(buf, request_id);
                buf.put_i64(*client_id);
                buf.put_i32(*virtual_port);
                put_optional_bytes(buf, session_tag.as_deref());
            }
            SessionMessage::RequestOk { request_id, virtual_port } => {
                put_request_id(buf, request_id);
                buf.put_i32(*virtual_port);
            }
            SessionMessage::ServiceRzvData { request_id, virtual_port, connection_id, server_id, server_ip } => {
                put_request_id(buf, request_id);
                buf.put_i32(*virtual_port);
                connection_id.ser(buf);
                buf.put_i32(*server_id);
                put_ip(buf, server_ip);
            }
            SessionMessage::ServiceAuthKey { virtual_port, connection_id, server_id, key } => {
                buf.put_i32(*virtual_port);
                connection_id.ser(buf);
                buf.put_i32(*server_id);
                buf.put_slice(key);
            }
            SessionMessage::ServiceAuthHash { virtual_port, connection_id, hash, key } => {
                buf.put_i32(*virtual_port);
                connection_id.ser(buf);
                buf.put_slice(hash);
                buf.put_slice(key);
            }
            SessionMessage::ServiceAuthError { virtual_port, connection_id } => {
                buf.put_i32(*virtual_port);
                connection_id.ser(buf);
            }
        }
    }

    /// Decodes a complete session message. Any error here is a framing violation of the session
    ///  as a whole.
    pub fn decode(mut buf: &[u8]) -> anyhow::Result<(ModuleId, SessionMessage)> {
        let module = ModuleId::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("unknown module id: {}", e.number))?;
        let tag = SessionTag::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("unknown session message tag: {}", e.number))?;

        let buf = &mut buf;
        let message = match tag {
            SessionTag::Request => SessionMessage::Request {
                request_id: try_get_request_id(buf)?,
                service_id: buf.try_get_i64()?,
                virtual_port: buf.try_get_i32()?,
                session_tag: try_get_session_tag(buf)?,
            },
            SessionTag::RpcRequest => SessionMessage::RpcRequest {
                request_id: try_get_request_id(buf)?,
                service_id: buf.try_get_i64()?,
                procedure: try_get_string(buf)?,
                args: try_get_bytes(buf)?,
                session_tag: try_get_session_tag(buf)?,
            },
            SessionTag::RzvData => SessionMessage::RzvData {
                request_id: try_get_request_id(buf)?,
                connection_id: ConnectionId::try_deser(buf)?,
                server_id: buf.try_get_i32()?,
                server_ip: try_get_ip(buf)?,
            },
            SessionTag::ConnectionAccepted => SessionMessage::ConnectionAccepted {
                request_id: try_get_request_id(buf)?,
            },
            SessionTag::RequestError => SessionMessage::RequestError {
                request_id: try_get_request_id(buf)?,
                code: buf.try_get_i32()?,
            },
            SessionTag::AuthKey => SessionMessage::AuthKey {
                request_id: try_get_request_id(buf)?,
                server_id: buf.try_get_i32()?,
                key: try_get_array(buf)?,
            },
            SessionTag::AuthHash => SessionMessage::AuthHash {
                request_id: try_get_request_id(buf)?,
                hash: try_get_array(buf)?,
                key: try_get_array(buf)?,
            },
            SessionTag::AuthError => SessionMessage::AuthError {
                request_id: try_get_request_id(buf)?,
            },
            SessionTag::RpcResult => SessionMessage::RpcResult {
                request_id: try_get_request_id(buf)?,
                result: try_get_bytes(buf)?,
            },
            SessionTag::SoftnetError => SessionMessage::SoftnetError {
                request_id: try_get_request_id(buf)?,
                code: buf.try_get_i32()?,
            },
            SessionTag::AppError => SessionMessage::AppError {
                request_id: try_get_request_id(buf)?,
                code: buf.try_get_i32()?,
                payload: try_get_bytes(buf)?,
            },
            SessionTag::IncomingRequest => SessionMessage::IncomingRequest {
                request_id: try_get_request_id(buf)?,
                client_id: buf.try_get_i64()?,
                virtual_port: buf.try_get_i32()?,
                session_tag: try_get_session_tag(buf)?,
            },
            SessionTag::RequestOk => SessionMessage::RequestOk {
                request_id: try_get_request_id(buf)?,
                virtual_port: buf.try_get_i32()?,
            },
            SessionTag::ServiceRzvData => SessionMessage::ServiceRzvData {
                request_id: try_get_request_id(buf)?,
                virtual_port: buf.try_get_i32()?,
                connection_id: ConnectionId::try_deser(buf)?,
                server_id: buf.try_get_i32()?,
                server_ip: try_get_ip(buf)?,
            },
            SessionTag::ServiceAuthKey => SessionMessage::ServiceAuthKey {
                virtual_port: buf.try_get_i32()?,
                connection_id: ConnectionId::try_deser(buf)?,
                server_id: buf.try_get_i32()?,
                key: try_get_array(buf)?,
            },
            SessionTag::ServiceAuthHash => SessionMessage::ServiceAuthHash {
                virtual_port: buf.try_get_i32()?,
                connection_id: ConnectionId::try_deser(buf)?,
                hash: try_get_array(buf)?,
                key: try_get_array(buf)?,
            },
            SessionTag::ServiceAuthError => SessionMessage::ServiceAuthError {
                virtual_port: buf.try_get_i32()?,
                connection_id: ConnectionId::try_deser(buf)?,
            },
        };
        ensure_consumed(&*buf)?;
        Ok((module, message))
    }
}

fn put_request_id(buf: &mut impl BufMut, request_id: &RequestId) {
    buf.put_slice(request_id.as_bytes());
}

fn try_get_request_id(buf: &mut impl Buf) -> anyhow::Result<RequestId> {
    Ok(Uuid::from_bytes(try_get_array(buf)?))
}

fn try_get_session_tag(buf: &mut impl Buf) -> anyhow::Result<Option<Bytes>> {
    let tag = try_get_optional_bytes(buf)?;
    if let Some(tag) = &tag {
        if tag.len() > MAX_SESSION_TAG_LEN {
            bail!("session tag is longer than {} bytes", MAX_SESSION_TAG_LEN);
        }
    }
    Ok(tag)
}

fn put_ip(buf: &mut impl BufMut, ip: &IpAddr) {
    match ip {
        IpAddr::V4(ip) => put_bytes(buf, &ip.octets()),
        IpAddr::V6(ip) => put_bytes(buf, &ip.octets()),
    }
}

fn try_get_ip(buf: &mut impl Buf) -> anyhow::Result<IpAddr> {
    let raw = try_get_bytes(buf)?;
    if let Ok(octets) = <[u8; 4]>::try_from(raw.as_ref()) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(raw.as_ref()) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    bail!("invalid IP address length {}", raw.len())
}
