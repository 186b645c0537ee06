//! Wire-format endpoint tuples
//!
//! `Tuple2` (6 bytes: IPv4 + port) and `Tuple4` (12 bytes: source + destination)
//! are the key domain for every table on the fast path. Both are packed
//! big-endian on the wire and reinterpretable directly from packet header
//! byte ranges.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// IPv4 endpoint: address + port.
///
/// Stored in host byte order; converted to network order only at the wire
/// boundary. Equality and hashing are pure integer comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tuple2 {
    /// IPv4 address (host byte order)
    pub ip: u32,
    /// L4 port (host byte order)
    pub port: u16,
}

impl Tuple2 {
    /// Encoded size on the wire
    pub const WIRE_LEN: usize = 6;

    /// Create from address octets and port
    #[inline(always)]
    pub const fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    /// Create from a standard library address
    pub fn from_addr(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: u32::from(addr),
            port,
        }
    }

    /// The address part
    #[inline(always)]
    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    /// Encode as 6 big-endian bytes (4 address + 2 port)
    #[inline(always)]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let ip = self.ip.to_be_bytes();
        let port = self.port.to_be_bytes();
        [ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
    }

    /// Decode from 6 big-endian bytes
    #[inline(always)]
    pub fn from_bytes(b: [u8; Self::WIRE_LEN]) -> Self {
        Self {
            ip: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            port: u16::from_be_bytes([b[4], b[5]]),
        }
    }

    /// Metrics/export name for this endpoint, e.g. `10.0.0.1:80`
    pub fn export_name(&self) -> String {
        format!("{}:{}", self.addr(), self.port)
    }
}

impl fmt::Display for Tuple2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr(), self.port)
    }
}

impl FromStr for Tuple2 {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sock: SocketAddrV4 = s
            .parse()
            .map_err(|_| ServiceError::InvalidAddress(s.to_string()))?;
        Ok(Self::from_addr(*sock.ip(), sock.port()))
    }
}

/// Directed flow key: source endpoint + destination endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple4 {
    /// Source endpoint
    pub src: Tuple2,
    /// Destination endpoint
    pub dst: Tuple2,
}

impl Tuple4 {
    /// Encoded size on the wire
    pub const WIRE_LEN: usize = 12;

    /// Create from endpoints
    #[inline(always)]
    pub const fn new(src: Tuple2, dst: Tuple2) -> Self {
        Self { src, dst }
    }

    /// The same flow seen from the other direction
    #[inline(always)]
    pub fn flip(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Encode as 12 big-endian bytes (source tuple then destination tuple)
    #[inline(always)]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[..6].copy_from_slice(&self.src.to_bytes());
        out[6..].copy_from_slice(&self.dst.to_bytes());
        out
    }

    /// Decode from 12 big-endian bytes
    #[inline(always)]
    pub fn from_bytes(b: [u8; Self::WIRE_LEN]) -> Self {
        let mut src = [0u8; 6];
        let mut dst = [0u8; 6];
        src.copy_from_slice(&b[..6]);
        dst.copy_from_slice(&b[6..]);
        Self {
            src: Tuple2::from_bytes(src),
            dst: Tuple2::from_bytes(dst),
        }
    }
}

impl fmt::Display for Tuple4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple2_byte_roundtrip() {
        let t = Tuple2::from_addr(Ipv4Addr::new(10, 0, 0, 1), 80);
        let b = t.to_bytes();
        assert_eq!(b, [10, 0, 0, 1, 0, 80]);
        assert_eq!(Tuple2::from_bytes(b), t);
    }

    #[test]
    fn test_tuple2_parse_display() {
        let t: Tuple2 = "192.168.1.10:8080".parse().unwrap();
        assert_eq!(t.port, 8080);
        assert_eq!(t.to_string(), "192.168.1.10:8080");

        assert!("not-an-endpoint".parse::<Tuple2>().is_err());
    }

    #[test]
    fn test_tuple4_byte_roundtrip() {
        let t = Tuple4::new(
            Tuple2::from_addr(Ipv4Addr::new(10, 0, 0, 5), 40000),
            Tuple2::from_addr(Ipv4Addr::new(10, 0, 0, 1), 80),
        );
        let b = t.to_bytes();
        assert_eq!(b.len(), Tuple4::WIRE_LEN);
        assert_eq!(Tuple4::from_bytes(b), t);
    }

    #[test]
    fn test_tuple4_flip() {
        let t = Tuple4::new(Tuple2::new(1, 2), Tuple2::new(3, 4));
        let f = t.flip();
        assert_eq!(f.src, t.dst);
        assert_eq!(f.dst, t.src);
        assert_eq!(f.flip(), t);
    }
}
