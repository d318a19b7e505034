//! IPv4 address helpers for the UDP transport
//!
//! The daemon binds to the host's primary interface, found by opening a UDP
//! "connection" towards a public resolver and reading back the local
//! endpoint the kernel picked. The route probe never sends a datagram. The
//! interface's netmask then yields the directed broadcast address used for
//! discovery.

use crate::error::{Error, Result};
use log::warn;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// Route-probe target; only used to select the outbound interface
const PROBE_ADDRESS: &str = "1.1.1.1:53";

/// Netmask assumed when the probed address matches no known interface
const FALLBACK_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// IPv4 address of the host's primary (default-route) interface
pub fn local_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(PROBE_ADDRESS)?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(addr) => Err(Error::Other(format!(
            "unexpected IPv6 local address: {}",
            addr
        ))),
    }
}

/// Netmask of the interface carrying `ip`, if any
pub fn netmask_of(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs().ok()?;
    for interface in interfaces {
        if let if_addrs::IfAddr::V4(v4) = interface.addr {
            if v4.ip == ip {
                return Some(v4.netmask);
            }
        }
    }
    None
}

/// Directed broadcast address: `ip | !netmask`
pub fn broadcast_of(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Local and broadcast socket addresses for the given port
pub fn udp_addresses(port: u16) -> Result<(SocketAddrV4, SocketAddrV4)> {
    let ip = local_ipv4()?;
    let netmask = netmask_of(ip).unwrap_or_else(|| {
        warn!("no interface found for {}, assuming /24 netmask", ip);
        FALLBACK_NETMASK
    });
    let broadcast = broadcast_of(ip, netmask);
    Ok((SocketAddrV4::new(ip, port), SocketAddrV4::new(broadcast, port)))
}

/// IPv4 address as a big-endian u32, the device-map key for address-only
/// configuration entries
pub fn ipv4_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

pub fn parse_ipv4(address: &str) -> Result<Ipv4Addr> {
    address
        .parse()
        .map_err(|_| Error::Config(format!("invalid IPv4 address: {}", address)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_to_u32_is_big_endian() {
        assert_eq!(ipv4_to_u32(Ipv4Addr::new(192, 168, 1, 40)), 0xc0a8_0128);
        assert_eq!(ipv4_to_u32(Ipv4Addr::new(0, 0, 0, 1)), 1);
    }

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4("192.168.1.40").unwrap(), Ipv4Addr::new(192, 168, 1, 40));
        assert!(parse_ipv4("not-an-address").is_err());
        assert!(parse_ipv4("fe80::1").is_err());
    }

    #[test]
    fn test_broadcast_of() {
        assert_eq!(
            broadcast_of(Ipv4Addr::new(192, 168, 1, 40), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_of(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(10, 1, 255, 255)
        );
        assert_eq!(
            broadcast_of(Ipv4Addr::new(172, 16, 5, 9), Ipv4Addr::new(255, 255, 255, 252)),
            Ipv4Addr::new(172, 16, 5, 11)
        );
    }
}
