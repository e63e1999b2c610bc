//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::net::TcpStream;

/// Address type byte for IPv4 targets
pub const ATYP_IPV4: u8 = 0x01;
/// Address type byte for domain targets
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type byte for IPv6 targets
pub const ATYP_IPV6: u8 = 0x04;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Target address carried in the tunnel request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Parse the leading address header out of a decrypted payload.
    ///
    /// Returns the target, the port, and the number of bytes consumed. Any
    /// remaining bytes belong to the tunneled stream and must reach the
    /// target before later payloads.
    pub fn parse_header(payload: &[u8]) -> Result<(Self, u16, usize)> {
        let atyp = *payload
            .first()
            .ok_or_else(|| Error::address("empty request header"))?;

        match atyp {
            ATYP_IPV4 => {
                if payload.len() < 7 {
                    return Err(Error::address("IPv4 header too short"));
                }
                let addr = Address::Ipv4(Ipv4Addr::new(
                    payload[1], payload[2], payload[3], payload[4],
                ));
                let port = u16::from_be_bytes([payload[5], payload[6]]);
                Ok((addr, port, 7))
            }
            ATYP_DOMAIN => {
                let len = *payload
                    .get(1)
                    .ok_or_else(|| Error::address("domain header too short"))?
                    as usize;
                if len == 0 {
                    return Err(Error::address("empty domain name"));
                }
                let end = 2 + len + 2;
                if payload.len() < end {
                    return Err(Error::address("domain header too short"));
                }
                let domain = std::str::from_utf8(&payload[2..2 + len])
                    .map_err(|e| Error::address(format!("invalid domain: {}", e)))?
                    .to_string();
                let port = u16::from_be_bytes([payload[2 + len], payload[3 + len]]);
                Ok((Address::Domain(domain), port, end))
            }
            ATYP_IPV6 => {
                if payload.len() < 19 {
                    return Err(Error::address("IPv6 header too short"));
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&payload[1..17]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([payload[17], payload[18]]);
                Ok((addr, port, 19))
            }
            t => Err(Error::address(format!("unknown address type: {}", t))),
        }
    }

    /// Get as IP if not a domain
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    /// Get as host string
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }

    /// Convert to string representation
    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }
}
