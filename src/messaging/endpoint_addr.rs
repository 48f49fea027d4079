use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use bytes::{Buf, BufMut};
use anyhow::bail;

use crate::util::buf::try_get_array;

/// The address family of a connection attempt is determined by the rendezvous server's address:
///  all endpoints exchanged during the attempt belong to the same family, so their wire encoding
///  has no discriminator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Whether an endpoint's IP bytes are bit-inverted on the wire. This keeps literal addresses out
///  of payloads that some middleboxes rewrite, and has no security relevance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpEncoding {
    Plain,
    Inverted,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> AddressFamily {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn endpoint_len(&self) -> usize {
        match self {
            AddressFamily::V4 => 6,
            AddressFamily::V6 => 18,
        }
    }

    pub fn unspecified(&self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn put_endpoint(&self, buf: &mut impl BufMut, addr: SocketAddr, encoding: IpEncoding) -> anyhow::Result<()> {
        if AddressFamily::of(&addr.ip()) != *self {
            bail!("endpoint {:?} does not belong to address family {:?}", addr, self);
        }

        match addr {
            SocketAddr::V4(data) => buf.put_u32(encoding.apply_u32(data.ip().to_bits())),
            SocketAddr::V6(data) => buf.put_u128(encoding.apply_u128(data.ip().to_bits())),
        }
        buf.put_u16(addr.port());
        Ok(())
    }

    pub fn try_get_endpoint(&self, buf: &mut impl Buf, encoding: IpEncoding) -> anyhow::Result<SocketAddr> {
        let addr = match self {
            AddressFamily::V4 => {
                let ip = encoding.apply_u32(buf.try_get_u32()?);
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            AddressFamily::V6 => {
                let ip = encoding.apply_u128(buf.try_get_u128()?);
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
        };
        Ok(addr)
    }
}

impl IpEncoding {
    fn apply_u32(&self, bits: u32) -> u32 {
        match self {
            IpEncoding::Plain => bits,
            IpEncoding::Inverted => !bits,
        }
    }

    fn apply_u128(&self, bits: u128) -> u128 {
        match self {
            IpEncoding::Plain => bits,
            IpEncoding::Inverted => !bits,
        }
    }
}

/// Identifies the rendezvous record of one data path. Issued by the server, distinct from the
///  request id.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct ConnectionId(pub [u8; 16]);

/// Identifies one side's UDP endpoint in hole punch and announcement datagrams
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct EndpointId(pub [u8; 16]);

macro_rules! hex_debug {
    ($t:ty) => {
        impl Debug for $t {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl $t {
            pub const SERIALIZED_LEN: usize = 16;

            pub fn ser(&self, buf: &mut impl BufMut) {
                buf.put_slice(&self.0);
            }

            pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
                Ok(Self(try_get_array(buf)?))
            }
        }
    };
}
hex_debug!(ConnectionId);
hex_debug!(EndpointId);
