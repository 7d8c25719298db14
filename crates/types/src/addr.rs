//! Network addresses as they appear on the wire.

use std::net::{IpAddr, Ipv6Addr};

use crate::error::DecodeError;
use crate::STREAM;

/// Serialized length of a [`NetAddrNoPrefix`].
pub const NET_ADDR_NO_PREFIX_LENGTH: usize = 26;

/// Serialized length of a [`NetAddr`].
pub const NET_ADDR_LENGTH: usize = 38;

/// A `(services, host, port)` triple without the time and stream prefix.
///
/// This is the form embedded in `version` messages. IPv4 hosts use the
/// `::ffff:0:0/96` mapping on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddrNoPrefix {
    pub services: u64,
    pub host: IpAddr,
    pub port: u16,
}

impl NetAddrNoPrefix {
    pub fn new(services: u64, host: IpAddr, port: u16) -> Self {
        Self {
            services,
            host,
            port,
        }
    }

    pub fn to_bytes(&self) -> [u8; NET_ADDR_NO_PREFIX_LENGTH] {
        let mut b = [0u8; NET_ADDR_NO_PREFIX_LENGTH];
        b[..8].copy_from_slice(&self.services.to_be_bytes());
        let host = match self.host {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        b[8..24].copy_from_slice(&host.octets());
        b[24..].copy_from_slice(&self.port.to_be_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, DecodeError> {
        if b.len() < NET_ADDR_NO_PREFIX_LENGTH {
            return Err(DecodeError::Truncated("net_addr_no_prefix"));
        }
        let services = u64::from_be_bytes(b[..8].try_into().expect("slice length checked"));
        let octets: [u8; 16] = b[8..24].try_into().expect("slice length checked");
        let v6 = Ipv6Addr::from(octets);
        let host = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = u16::from_be_bytes(b[24..26].try_into().expect("slice length checked"));
        Ok(Self {
            services,
            host,
            port,
        })
    }
}

/// A full address record as carried in `addr` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddr {
    /// Last-seen time of the peer, seconds since the Unix epoch.
    pub time: u64,
    pub stream: u32,
    pub services: u64,
    pub host: IpAddr,
    pub port: u16,
}

impl NetAddr {
    /// Construct a record for the single stream this node relays.
    pub fn new(services: u64, host: IpAddr, port: u16, time: u64) -> Self {
        Self {
            time,
            stream: STREAM as u32,
            services,
            host,
            port,
        }
    }

    pub fn to_bytes(&self) -> [u8; NET_ADDR_LENGTH] {
        let mut b = [0u8; NET_ADDR_LENGTH];
        b[..8].copy_from_slice(&self.time.to_be_bytes());
        b[8..12].copy_from_slice(&self.stream.to_be_bytes());
        b[12..].copy_from_slice(
            &NetAddrNoPrefix::new(self.services, self.host, self.port).to_bytes(),
        );
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, DecodeError> {
        if b.len() < NET_ADDR_LENGTH {
            return Err(DecodeError::Truncated("net_addr"));
        }
        let time = u64::from_be_bytes(b[..8].try_into().expect("slice length checked"));
        let stream = u32::from_be_bytes(b[8..12].try_into().expect("slice length checked"));
        let addr = NetAddrNoPrefix::from_bytes(&b[12..])?;
        Ok(Self {
            time,
            stream,
            services: addr.services,
            host: addr.host,
            port: addr.port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ipv4_uses_mapped_encoding() {
        let addr = NetAddrNoPrefix::new(1, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 8444);
        let bytes = addr.to_bytes();
        assert_eq!(
            &bytes[8..24],
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 203, 0, 113, 7]
        );
        assert_eq!(NetAddrNoPrefix::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn ipv6_round_trips() {
        let host: IpAddr = "2001:db8::1".parse().unwrap();
        let addr = NetAddrNoPrefix::new(3, host, 8444);
        assert_eq!(NetAddrNoPrefix::from_bytes(&addr.to_bytes()).unwrap(), addr);
    }

    #[test]
    fn net_addr_round_trips() {
        let addr = NetAddr::new(3, IpAddr::V4(Ipv4Addr::LOCALHOST), 8444, 1700000000);
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), NET_ADDR_LENGTH);
        assert_eq!(NetAddr::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(matches!(
            NetAddr::from_bytes(&[0u8; 37]),
            Err(DecodeError::Truncated(_))
        ));
    }
}
