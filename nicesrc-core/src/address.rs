//! Address translation: agent transport addresses to pipeline socket addresses.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Address family numbers as reported by the agent (Linux values).
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

/// Transport address as the agent reports it for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportAddress {
    Ipv4 { ip: [u8; 4], port: u16 },
    Ipv6 { ip: [u8; 16], port: u16 },
    /// Unset or non-IP family. Carries the raw family number.
    Unsupported { family: u16 },
}

impl TransportAddress {
    pub fn family(&self) -> u16 {
        match self {
            TransportAddress::Ipv4 { .. } => AF_INET,
            TransportAddress::Ipv6 { .. } => AF_INET6,
            TransportAddress::Unsupported { family } => *family,
        }
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => TransportAddress::Ipv4 {
                ip: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => TransportAddress::Ipv6 {
                ip: v6.ip().octets(),
                port: v6.port(),
            },
        }
    }
}

/// Translate an agent address into the pipeline representation.
/// Returns `None` for families the pipeline cannot carry.
pub fn to_net_address(addr: &TransportAddress) -> Option<SocketAddr> {
    match *addr {
        TransportAddress::Ipv4 { ip, port } => {
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }
        TransportAddress::Ipv6 { ip, port } => Some(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::from(ip),
            port,
            0,
            0,
        ))),
        TransportAddress::Unsupported { .. } => None,
    }
}

/// Overwrite `target` with the translated address. An unsupported family leaves it untouched.
pub fn translate_into(addr: &TransportAddress, target: &mut Option<SocketAddr>) {
    if let Some(net) = to_net_address(addr) {
        *target = Some(net);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_translates() {
        let addr = TransportAddress::Ipv4 {
            ip: [192, 168, 1, 20],
            port: 5004,
        };
        assert_eq!(
            to_net_address(&addr),
            Some("192.168.1.20:5004".parse().unwrap())
        );
        assert_eq!(addr.family(), AF_INET);
    }

    #[test]
    fn ipv6_translates() {
        let sock: SocketAddr = "[2001:db8::7]:40000".parse().unwrap();
        let addr = TransportAddress::from(sock);
        assert_eq!(addr.family(), AF_INET6);
        assert_eq!(to_net_address(&addr), Some(sock));
    }

    #[test]
    fn unsupported_family_leaves_target() {
        let previous: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let mut target = Some(previous);
        translate_into(&TransportAddress::Unsupported { family: 1 }, &mut target);
        assert_eq!(target, Some(previous));

        let mut unset = None;
        translate_into(&TransportAddress::Unsupported { family: 0 }, &mut unset);
        assert!(unset.is_none());
    }

    #[test]
    fn translate_into_overwrites() {
        let mut target = Some("10.0.0.1:1000".parse().unwrap());
        let addr = TransportAddress::Ipv4 {
            ip: [127, 0, 0, 1],
            port: 9,
        };
        translate_into(&addr, &mut target);
        assert_eq!(target, Some("127.0.0.1:9".parse().unwrap()));
    }
}
