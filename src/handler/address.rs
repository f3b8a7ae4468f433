//! SOCKS5-style target address header.
//!
//! Wire format: `ATYP | ADDR | PORT`, where `ATYP` is 0x01 (IPv4, 4 bytes),
//! 0x03 (domain, 1 length byte then the name) or 0x04 (IPv6, 16 bytes), and
//! `PORT` is big-endian.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Destination requested by a tunnel client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Parse a header from the front of `buf`.
    ///
    /// Returns the address and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let (&atyp, rest) = buf
            .split_first()
            .ok_or_else(|| Error::invalid_address("empty header"))?;

        match atyp {
            ATYP_IPV4 => {
                let body = take(rest, 4 + 2)?;
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok((TargetAddr::Ip(SocketAddrV4::new(ip, port).into()), 1 + 6))
            }
            ATYP_IPV6 => {
                let body = take(rest, 16 + 2)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                let addr = SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0);
                Ok((TargetAddr::Ip(addr.into()), 1 + 18))
            }
            ATYP_DOMAIN => {
                let (&len, rest) = rest
                    .split_first()
                    .ok_or_else(|| Error::invalid_address("missing domain length"))?;
                let len = len as usize;
                let body = take(rest, len + 2)?;
                let domain = parse_domain(&body[..len])?;
                let port = u16::from_be_bytes([body[len], body[len + 1]]);
                Ok((TargetAddr::Domain(domain, port), 1 + 1 + len + 2))
            }
            other => Err(Error::UnsupportedAddressType(other)),
        }
    }

    /// Read one header from a stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let atyp = reader.read_u8().await?;

        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Ip(SocketAddrV4::new(octets.into(), port).into()))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                let addr = SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0);
                Ok(TargetAddr::Ip(addr.into()))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Domain(parse_domain(&name)?, port))
            }
            other => Err(Error::UnsupportedAddressType(other)),
        }
    }

    /// Append the encoded header to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                // Parsed domains never exceed 255 bytes
                let name = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

fn take(buf: &[u8], len: usize) -> Result<&[u8]> {
    buf.get(..len).ok_or_else(|| {
        Error::invalid_address(format!("truncated header: need {} bytes, got {}", len, buf.len()))
    })
}

fn parse_domain(raw: &[u8]) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::invalid_address("empty domain"));
    }
    let domain =
        std::str::from_utf8(raw).map_err(|_| Error::invalid_address("domain is not UTF-8"))?;
    Ok(domain.to_string())
}
